//! Smoke tests for the nodelink CLI.
//!
//! These tests verify basic CLI functionality:
//! - `nodelink --version` outputs version info
//! - `nodelink --help` lists the commands
//! - `nodelink` (no args) prints usage

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a Command for the nodelink binary.
fn nodelink() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nodelink"))
}

#[test]
fn test_version_flag() {
    nodelink()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodelink"))
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_flag() {
    nodelink()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("alloc"))
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn test_alloc_help_lists_resource_options() {
    nodelink()
        .args(["alloc", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--partition"))
        .stdout(predicate::str::contains("--time"))
        .stdout(predicate::str::contains("--mem"))
        .stdout(predicate::str::contains("--gpus"))
        .stdout(predicate::str::contains("--interactive"));
}

#[test]
fn test_no_args_prints_usage() {
    nodelink()
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn test_unknown_command_fails() {
    nodelink().arg("frobnicate").assert().failure();
}
