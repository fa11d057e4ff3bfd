//! Black-box CLI tests for the `forge` binary.
//!
//! These exercise the binary the way an operator would: argument parsing,
//! help/version output, and `migrate` against a scratch config directory.
//! `serve` itself isn't exercised here since it blocks until Ctrl+C or a
//! Docker daemon is required to provision a sandbox — that's covered by
//! the in-process router tests in `factory::api`/`factory::server`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn forge() -> Command {
    Command::cargo_bin("forge").unwrap()
}

#[test]
fn forge_help_succeeds() {
    forge().arg("--help").assert().success();
}

#[test]
fn forge_version_succeeds() {
    forge().arg("--version").assert().success();
}

#[test]
fn forge_with_no_subcommand_fails() {
    forge().assert().failure();
}

#[test]
fn migrate_creates_database_at_default_path() {
    let dir = TempDir::new().unwrap();

    forge()
        .current_dir(dir.path())
        .arg("--config")
        .arg(dir.path().join("orchestrator.toml"))
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database ready"));

    assert!(dir.path().join(".forge/orchestrator.sqlite3").exists());
}

#[test]
fn migrate_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("orchestrator.toml");

    forge()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config_path)
        .arg("migrate")
        .assert()
        .success();

    forge()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config_path)
        .arg("migrate")
        .assert()
        .success();
}
