//! Tests for the `send` command that need no running daemon.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_send_requires_words() {
    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("send");

    cmd.assert().failure().code(2);
}

#[test]
fn test_send_to_missing_socket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("absent.sock");

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("send").arg("--socket").arg(&socket).arg("ping");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to connect"));
}
