use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use mote_ipc::transport;

use crate::RuntimeError;

/// Directory under the user config root holding mote state.
pub const CONFIG_DIR: &str = "mote";
/// Runtime configuration filename.
pub const CONFIG_FILE: &str = "config.toml";

/// Optional on-disk runtime configuration.
///
/// Every field has a sensible default; a missing file is not an error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Overrides the platform transport endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tray_executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_executable: Option<PathBuf>,
    /// Overrides copilot CLI discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot_binary: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl RuntimeConfig {
    /// Canonical config path under the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads the canonical config file, defaulting when absent.
    pub fn load() -> Result<Self, RuntimeError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads a specific config file, defaulting when absent.
    pub fn load_from(path: &Path) -> Result<Self, RuntimeError> {
        if !path.exists() {
            debug!(path = %path.display(), "no runtime config, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| RuntimeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| RuntimeError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The transport endpoint the broker should bind.
    pub fn endpoint(&self) -> String {
        self.socket_path
            .clone()
            .unwrap_or_else(|| transport::DEFAULT_ENDPOINT.to_string())
    }
}
