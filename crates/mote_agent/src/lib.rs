#![forbid(unsafe_code)]
//! Streaming chat adapter over the copilot CLI's ACP dialect.
//!
//! The CLI is spawned as `copilot --acp --stdio --allow-all` and speaks
//! JSON-RPC 2.0, one object per line. [`AcpChannel`] owns the process and
//! the request/response correlation; [`AgentAdapter`] layers conversation
//! state on top: per-conversation remote sessions, streamed
//! content/thinking/tool-call events, local tools bridged behind the
//! `mote_` prefix, and forced CLI restart when a prompt is cancelled
//! (the protocol has no native cancel).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mote_agent::{AgentAdapter, AgentConfig, ChatMessage, MessageRole, StreamRequest};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = Arc::new(AgentAdapter::new(AgentConfig::default()));
//! let mut stream = adapter
//!     .stream(StreamRequest {
//!         conversation_id: Some("c1".into()),
//!         messages: vec![ChatMessage::new(MessageRole::User, "hello")],
//!         ..Default::default()
//!     })
//!     .await?;
//! while let Some(event) = stream.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(()) }
//! ```

mod adapter;
mod channel;
pub mod cli;
mod error;
pub mod mcp;
pub mod prompt;
pub mod protocol;
pub mod tools;

pub use adapter::{
    AgentAdapter, AgentConfig, AgentStream, PauseController, StreamRequest, WorkdirResolver,
    DEFAULT_ACP_MODEL, DEFAULT_CONVERSATION, EVENT_SINK_CAPACITY,
};
pub use channel::{
    AcpChannel, ChannelConfig, ChannelHandlers, HooksFuture, HooksHandler, NotificationFuture,
    NotificationHandler, ToolCallHandler, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::AgentError;
pub use prompt::{Attachment, ChatMessage, MessageRole};
pub use protocol::{AgentEvent, ContentBlock, SessionUpdate, StopReason, ToolCallInfo};
pub use tools::{FnToolRegistry, SharedToolRegistry, ToolRegistry};

#[cfg(test)]
mod tests;
