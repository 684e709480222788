use std::{collections::BTreeMap, fs};

use serde_json::json;

use crate::mcp::{load, to_legacy_array, to_wire_map, McpServerConfig, McpServerMap};

fn sample_servers() -> McpServerMap {
    let mut servers = McpServerMap::new();
    servers.insert(
        "search".to_string(),
        McpServerConfig {
            command: "search-server".to_string(),
            args: vec!["--fast".to_string()],
            env: BTreeMap::from([("TOKEN".to_string(), "abc".to_string())]),
        },
    );
    servers.insert(
        "bare".to_string(),
        McpServerConfig {
            command: "bare-server".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
    );
    servers
}

#[test]
fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let servers = load(&dir.path().join("mcp_servers.json")).expect("load");
    assert!(servers.is_empty());
}

#[test]
fn file_round_trips_the_server_map() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mcp_servers.json");
    fs::write(
        &path,
        r#"{"mcpServers": {"search": {"command": "search-server", "args": ["--fast"], "env": {"TOKEN": "abc"}}}}"#,
    )
    .expect("write");

    let servers = load(&path).expect("load");
    assert_eq!(servers.len(), 1);
    let search = servers.get("search").expect("search entry");
    assert_eq!(search.command, "search-server");
    assert_eq!(search.args, vec!["--fast"]);
    assert_eq!(search.env.get("TOKEN").map(String::as_str), Some("abc"));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mcp_servers.json");
    fs::write(&path, "{not json").expect("write");
    assert!(matches!(
        load(&path),
        Err(crate::AgentError::McpConfigParse { .. })
    ));
}

#[test]
fn legacy_array_always_carries_args_and_env_arrays() {
    let value = to_legacy_array(&sample_servers());
    let entries = value.as_array().expect("array shape");
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert!(entry.get("name").is_some());
        assert!(entry["args"].is_array(), "args must be a non-null array");
        assert!(entry["env"].is_array(), "env must be a non-null array");
    }

    let bare = entries
        .iter()
        .find(|entry| entry["name"] == "bare")
        .expect("bare entry");
    assert_eq!(bare["args"], json!([]));
    assert_eq!(bare["env"], json!([]));

    let search = entries
        .iter()
        .find(|entry| entry["name"] == "search")
        .expect("search entry");
    assert_eq!(search["env"], json!([{"name": "TOKEN", "value": "abc"}]));
}

#[test]
fn wire_map_keeps_the_map_shape() {
    let value = to_wire_map(&sample_servers());
    assert_eq!(
        value["search"],
        json!({"command": "search-server", "args": ["--fast"], "env": {"TOKEN": "abc"}})
    );
    assert_eq!(
        value["bare"],
        json!({"command": "bare-server", "args": [], "env": {}})
    );
}
