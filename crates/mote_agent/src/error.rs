use std::{io, path::PathBuf, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced while driving the copilot CLI.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("copilot binary not found; searched {searched:?}")]
    CliNotFound { searched: Vec<PathBuf> },
    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("agent returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("prompt was cancelled")]
    Cancelled,
    #[error("agent process exited")]
    ProcessDied,
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session create returned no session id")]
    MissingSessionId,
    #[error("client restart did not settle in time")]
    RestartPending,
    #[error("failed to read mcp config at `{path}`: {source}")]
    McpConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse mcp config at `{path}`: {source}")]
    McpConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
