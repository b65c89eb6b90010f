//! CLI subprocess integration tests.
//!
//! These invoke the `bridgekeeper` binary with a mock runtime backend and a
//! temporary data directory, checking exit codes and JSON output.

use std::path::Path;
use std::process::Command;

fn bridgekeeper_bin(data_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bridgekeeper"));
    cmd.env("BRIDGEKEEPER_DATA_DIR", data_dir);
    cmd.env_remove("BRIDGEKEEPER_CATALOG_URL");
    cmd.env("BRIDGEKEEPER_LOG", "error");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("bridgekeeper.toml");
    std::fs::write(
        &path,
        r#"orphan_grace_secs = 30

[runtime]
backend = "mock"
channel_tag = "stable"
"#,
    )
    .unwrap();
    path
}

fn write_descriptor(data_dir: &Path, type_id: &str, file: &str, version: &str) {
    let type_dir = data_dir.join("bridge-types").join(type_id);
    std::fs::create_dir_all(&type_dir).unwrap();
    let descriptor = serde_json::json!({
        "type": type_id,
        "registry": format!("registry.example.com/bridges/{type_id}"),
        "version": version
    });
    std::fs::write(type_dir.join(file), descriptor.to_string()).unwrap();
}

#[test]
fn cli_help_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = bridgekeeper_bin(dir.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("inventory"));
}

#[test]
fn cli_config_reflects_file_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = bridgekeeper_bin(&dir.path().join("data"))
        .args(["--config", config.to_str().unwrap(), "--json", "config"])
        .env("BRIDGEKEEPER_REGISTRY_USER", "deploy")
        .env("BRIDGEKEEPER_REGISTRY_PASS", "hunter2")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["runtime"]["backend"], "mock");
    assert_eq!(json["runtime"]["channel_tag"], "stable");
    assert_eq!(json["orphan_grace_secs"], 30);
    assert_eq!(json["registry"]["username"], "deploy");
    assert_ne!(json["registry"]["password"], "hunter2");
}

#[test]
fn cli_types_lists_installed_and_staged() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_descriptor(&data, "zigbee", "local.configuration.json", "1.0");
    write_descriptor(&data, "zigbee", "update.configuration.json", "1.1");
    write_descriptor(&data, "zwave", "update.configuration.json", "0.9");

    let output = bridgekeeper_bin(&data)
        .args(["--json", "types"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["type"], "zigbee");
    assert_eq!(rows[0]["installed"], "1.0");
    assert_eq!(rows[0]["staged"], "1.1");
    assert_eq!(rows[0]["updateAvailable"], true);
    assert_eq!(rows[1]["type"], "zwave");
    assert!(rows[1]["installed"].is_null());
}

#[test]
fn cli_inventory_with_mock_backend_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = bridgekeeper_bin(&dir.path().join("data"))
        .args(["--config", config.to_str().unwrap(), "--json", "inventory"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows, serde_json::json!([]));
}

#[test]
fn cli_catalog_without_url_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = bridgekeeper_bin(dir.path()).arg("catalog").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no catalog configured"));
}

#[test]
fn cli_unknown_backend_is_a_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[runtime]\nbackend = \"podman\"\n").unwrap();
    let output = bridgekeeper_bin(dir.path())
        .args(["--config", path.to_str().unwrap(), "inventory"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn cli_malformed_config_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "orphan_grace_secs = \"soon\"\n").unwrap();
    let output = bridgekeeper_bin(dir.path())
        .args(["--config", path.to_str().unwrap(), "types"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
