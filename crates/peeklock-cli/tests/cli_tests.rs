//! End-to-end tests for the peeklock binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn peeklock() -> Command {
    let mut command = Command::cargo_bin("peeklock").unwrap();
    command.env_remove("RUST_LOG").env_remove("PEEKLOCK_CONFIG");
    command
}

#[test]
fn test_help_lists_commands() {
    peeklock()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_run_prints_text_summary() {
    peeklock()
        .args(["run", "-n", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed:         3"))
        .stdout(predicate::str::contains("peeklock-demo"));
}

#[test]
fn test_run_prints_json_summary() {
    let output = peeklock()
        .args([
            "run",
            "--mode",
            "serial",
            "--batch-size",
            "2",
            "-n",
            "4",
            "--dead-letter-every",
            "2",
            "--format",
            "json",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["completed"], 2);
    assert_eq!(summary["dead_lettered"], 2);
    assert_eq!(summary["mode"], "serial");
}

#[test]
fn test_config_from_file_and_environment() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(b"receiver:\n  topic_or_queue_name: orders\n  deadline_seconds: 10\n")
        .unwrap();

    peeklock()
        .arg("--config")
        .arg(file.path())
        .env("PEEKLOCK__RECEIVER__MODE", "batch")
        .args(["config", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"topic_or_queue_name\": \"orders\""))
        .stdout(predicate::str::contains("\"deadline_seconds\": 10"))
        .stdout(predicate::str::contains("\"mode\": \"batch\""));
}

#[test]
fn test_invalid_config_exit_code() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(
        b"receiver:\n  topic_or_queue_name: orders\n  renew_message_lock: true\n  \
          renew_message_time_seconds: 90\n",
    )
    .unwrap();

    peeklock()
        .arg("--config")
        .arg(file.path())
        .arg("config")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("renew_message_time"));
}

#[test]
fn test_zero_batch_size_exit_code() {
    peeklock()
        .args(["run", "--mode", "batch", "--batch-size", "0"])
        .assert()
        .code(1);
}
