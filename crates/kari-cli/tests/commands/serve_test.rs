//! Tests for the `serve` command, driving a real daemon over its socket.

use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

use super::{socket_path, write_workspace};

/// Test that serve lists its options.
#[test]
fn test_serve_help() {
    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("serve").arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--socket"))
        .stdout(predicate::str::contains("--interval"))
        .stdout(predicate::str::contains("--no-socket"));
}

/// Test that a non-positive interval is rejected before booting.
#[test]
fn test_serve_rejects_zero_interval() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(dir.path());

    let mut cmd = Command::cargo_bin("kari").unwrap();
    cmd.arg("serve")
        .arg("--config")
        .arg(&config)
        .arg("--interval")
        .arg("0");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("pulse_interval_secs must be positive"));
}

struct Daemon {
    child: Child,
}

impl Daemon {
    fn start(config: &Path) -> Self {
        let child = StdCommand::new(assert_cmd::cargo::cargo_bin("kari"))
            .arg("serve")
            .arg("--config")
            .arg(config)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        Self { child }
    }

    fn terminate(&mut self) -> std::process::ExitStatus {
        StdCommand::new("kill")
            .arg("-TERM")
            .arg(self.child.id().to_string())
            .status()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "daemon did not exit after SIGTERM");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "socket never appeared");
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn send(socket: &Path, words: &[&str]) -> (bool, Value) {
    let output = Command::cargo_bin("kari")
        .unwrap()
        .arg("send")
        .arg("--socket")
        .arg(socket)
        .args(words)
        .output()
        .unwrap();
    let value = serde_json::from_slice(&output.stdout).unwrap();
    (output.status.success(), value)
}

/// Boot the daemon, talk to it, and stop it with SIGTERM.
#[test]
fn test_serve_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(dir.path());
    let socket = socket_path(dir.path());

    let mut daemon = Daemon::start(&config);
    wait_for(&socket);

    let (ok, pong) = send(&socket, &["ping"]);
    assert!(ok);
    assert_eq!(pong["result"]["pong"], true);

    let (ok, mods) = send(&socket, &["mods"]);
    assert!(ok);
    let names: Vec<&str> = mods["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Pulse Matrix", "Voice Box"]);

    let (ok, spoken) = send(&socket, &["call", "voice", "speak", r#"{"text": "testing"}"#]);
    assert!(ok);
    assert_eq!(spoken["result"], "testing");

    // Vitals appear once the pulse has ticked.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (_, status) = send(&socket, &["status"]);
        if status["result"]["tick"].as_u64().unwrap_or(0) > 0
            && status["result"]["vitals"]["mem_usage"].is_number()
        {
            break;
        }
        assert!(Instant::now() < deadline, "pulse never published vitals");
        std::thread::sleep(Duration::from_millis(100));
    }

    let (ok, unknown) = send(&socket, &["call", "Nobody", "say"]);
    assert!(!ok);
    assert_eq!(unknown["error"]["kind"], "UnknownModule");

    let status = daemon.terminate();
    assert!(status.success());
    assert!(!socket.exists());
}
