//! Smoke tests -- verify the binary runs and the CLI surface is intact.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Multi-sensor anomaly watcher"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("driftwatch"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--demo"));
}

#[test]
fn test_patterns_calibration_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["patterns", "calibration", "--help"])
        .assert()
        .success();
}

#[test]
fn test_patterns_show_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["patterns", "show", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--sources"));
}

#[test]
fn test_patterns_show_missing_file_fails() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["patterns", "show", "--file", "/nonexistent/patterns.json"])
        .assert()
        .failure();
}
