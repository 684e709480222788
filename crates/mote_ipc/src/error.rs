use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::message::{MessageKind, Role};

/// Errors surfaced by the IPC codec, broker, and client.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to bind local transport at `{path}`: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to local transport at `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize frame: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("transport read failed: {0}")]
    Read(#[source] io::Error),
    #[error("transport write failed: {0}")]
    Write(#[source] io::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("no client connected for role `{0}`")]
    RoleNotConnected(Role),
    #[error("message of kind `{kind}` carries no payload")]
    MissingPayload { kind: MessageKind },
    #[error("payload decoder for `{expected}` applied to a `{actual}` message")]
    KindMismatch {
        expected: MessageKind,
        actual: MessageKind,
    },
}
