//! Persisted MCP server configuration.
//!
//! Servers live in a JSON file under the user config directory and are
//! re-read before every new session, so servers added at runtime become
//! visible without a restart.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::AgentError;

/// Filename under the `mote` config directory.
pub const MCP_CONFIG_FILE: &str = "mcp_servers.json";

/// One configured MCP server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Servers keyed by name; the canonical on-disk shape.
pub type McpServerMap = BTreeMap<String, McpServerConfig>;

#[derive(Debug, Default, Deserialize)]
struct McpConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: McpServerMap,
}

/// Canonical config path under the user's config directory.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mote").join(MCP_CONFIG_FILE))
}

/// Loads the server map, treating a missing file as empty.
pub fn load(path: &Path) -> Result<McpServerMap, AgentError> {
    if !path.exists() {
        debug!(path = %path.display(), "no mcp config on disk");
        return Ok(McpServerMap::new());
    }
    let raw = fs::read_to_string(path).map_err(|source| AgentError::McpConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let file: McpConfigFile =
        serde_json::from_str(&raw).map_err(|source| AgentError::McpConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.mcp_servers)
}

/// Map-shaped wire form used by protocol >= 2 session creation.
pub fn to_wire_map(servers: &McpServerMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, server) in servers {
        map.insert(
            name.clone(),
            json!({
                "command": server.command,
                "args": server.args,
                "env": server.env,
            }),
        );
    }
    Value::Object(map)
}

/// Array-shaped wire form the legacy `session/new` demands.
///
/// `args` and `env` must be present as non-null arrays even when empty.
pub fn to_legacy_array(servers: &McpServerMap) -> Value {
    let entries: Vec<Value> = servers
        .iter()
        .map(|(name, server)| {
            let env: Vec<Value> = server
                .env
                .iter()
                .map(|(key, value)| json!({"name": key, "value": value}))
                .collect();
            json!({
                "name": name,
                "command": server.command,
                "args": server.args,
                "env": env,
            })
        })
        .collect();
    Value::Array(entries)
}
