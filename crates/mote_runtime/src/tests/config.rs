use std::{fs, path::PathBuf};

use mote_ipc::transport;

use crate::RuntimeConfig;

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RuntimeConfig::load_from(&dir.path().join("config.toml")).expect("load");
    assert_eq!(config, RuntimeConfig::default());
    assert_eq!(config.endpoint(), transport::DEFAULT_ENDPOINT);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
socket_path = "/tmp/mote-test.sock"
tray_executable = "/opt/mote/tray"
default_model = "gpt-5"
"#,
    )
    .expect("write config");

    let config = RuntimeConfig::load_from(&path).expect("load");
    assert_eq!(config.endpoint(), "/tmp/mote-test.sock");
    assert_eq!(config.tray_executable, Some(PathBuf::from("/opt/mote/tray")));
    assert_eq!(config.default_model.as_deref(), Some("gpt-5"));
    assert!(config.copilot_binary.is_none());
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "socket_path = [not toml").expect("write config");

    assert!(matches!(
        RuntimeConfig::load_from(&path),
        Err(crate::RuntimeError::ConfigParse { .. })
    ));
}
