use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::{json, Value};

/// Prefix the CLI applies to bridged tool names.
pub const BRIDGED_TOOL_PREFIX: &str = "mote_";

/// Tools the CLI provides natively; never bridged to the local registry.
pub const NATIVE_TOOLS: &[&str] = &["shell", "read_file", "write_file", "edit_file", "list_dir"];

/// Boxed future returned by registry invocations.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Host-side registry of tools bridged into the remote agent.
pub trait ToolRegistry: Send + Sync {
    /// Invokes a local tool by its unprefixed name.
    fn invoke(&self, name: &str, arguments: Value) -> ToolFuture;
}

/// Registry backed by a closure, convenient for hosts and tests.
pub struct FnToolRegistry<F>(pub F);

impl<F> ToolRegistry for FnToolRegistry<F>
where
    F: Fn(&str, Value) -> ToolFuture + Send + Sync,
{
    fn invoke(&self, name: &str, arguments: Value) -> ToolFuture {
        (self.0)(name, arguments)
    }
}

/// Whether a tool name belongs to the CLI's native set.
pub fn is_native_tool(name: &str) -> bool {
    NATIVE_TOOLS.contains(&name)
}

/// Strips the bridged prefix, returning the local tool name.
pub fn local_tool_name(remote_name: &str) -> &str {
    remote_name
        .strip_prefix(BRIDGED_TOOL_PREFIX)
        .unwrap_or(remote_name)
}

/// Wire shape of a bridged tool outcome.
pub fn bridged_result(outcome: Result<Value, String>) -> Value {
    match outcome {
        Ok(content) => json!({"type": "success", "content": content}),
        Err(message) => json!({"type": "failure", "error": message}),
    }
}

/// Shared handle hosts pass to the adapter.
pub type SharedToolRegistry = Arc<dyn ToolRegistry>;
