use std::{io, path::PathBuf};

use thiserror::Error;

use mote_ipc::IpcError;

/// Errors surfaced by the supervisor, bridge, and runtime configuration.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("process `{0}` already exists")]
    AlreadyExists(String),
    #[error("process `{0}` not found")]
    NotFound(String),
    #[error("failed to spawn `{name}` from `{executable}`: {source}")]
    Spawn {
        name: String,
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("process `{0}` exited before registering with the broker")]
    ExitedBeforeRegistration(String),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("failed to read config at `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at `{path}`: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
