//! Tests for the `check` command.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

use super::write_workspace;

#[test]
fn test_check_reports_shipped_modules() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(dir.path());

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("check").arg("--config").arg(&config);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Attached (2):"))
        .stdout(predicate::str::contains("Pulse Matrix"))
        .stdout(predicate::str::contains("Voice Box"))
        .stdout(predicate::str::contains("2/2 modules responsive"));
}

#[test]
fn test_check_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(dir.path());

    let mut cmd = Command::cargo_bin("kari").unwrap();
    let output = cmd
        .arg("check")
        .arg("--json")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        report["attached"],
        serde_json::json!(["Pulse Matrix", "Voice Box"])
    );
    assert_eq!(report["ready"], 2);
    assert_eq!(report["failures"], serde_json::json!([]));
}

#[test]
fn test_check_fails_on_unit_without_implementation() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(dir.path());
    std::fs::write(
        dir.path().join("addons").join("ghost_relay.toml"),
        "name = \"Ghost Relay\"\nversion = \"0.1.0\"\n",
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("check").arg("--config").arg(&config);

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("ghost_relay [missing_implementation]"))
        .stdout(predicate::str::contains("2/2 modules responsive"));
}

#[test]
fn test_check_missing_builtin_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("kari.toml");
    std::fs::write(
        &config,
        format!(
            "[modules]\nbuiltin_root = {:?}\n",
            dir.path().join("nowhere").display().to_string()
        ),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("check").arg("--config").arg(&config);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load modules"));
}

#[test]
fn test_check_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("kari.toml");
    std::fs::write(&config, "pulse_interval_secs = \"soon\"\n").unwrap();

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("check").arg("--config").arg(&config);

    cmd.assert().failure();
}
