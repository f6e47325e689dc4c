//! Common test utilities for nodelink integration tests.
//!
//! Provides `TestEnv` for isolated test environments that never touch the
//! user's real `~/.ssh/config` or `~/.config/nodelink/`.

#![allow(dead_code)]

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A test environment with an isolated home directory.
///
/// The `nodelink()` method returns a `Command` with `HOME` pointed at the
/// temp directory and `NODELINK_CONFIG` pointed at a settings file inside
/// it, so tests are parallel-safe.
pub struct TestEnv {
    pub home: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the nodelink binary with an isolated home.
    pub fn nodelink(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_nodelink"));
        cmd.current_dir(self.home.path());
        cmd.env("HOME", self.home.path());
        cmd.env("NODELINK_CONFIG", self.config_path());
        cmd.env_remove("NODELINK_LOG");
        cmd
    }

    pub fn path(&self) -> &Path {
        self.home.path()
    }

    /// Settings file used by `nodelink()`.
    pub fn config_path(&self) -> PathBuf {
        self.home.path().join("nodelink.kdl")
    }

    /// SSH config at the default location under the temp home.
    pub fn ssh_config_path(&self) -> PathBuf {
        self.home.path().join(".ssh").join("config")
    }

    pub fn write_config(&self, content: &str) {
        fs::write(self.config_path(), content).expect("Failed to write settings file");
    }

    pub fn write_ssh_config(&self, content: &str) {
        let path = self.ssh_config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create .ssh directory");
        }
        fs::write(path, content).expect("Failed to write ssh config");
    }

    pub fn read_ssh_config(&self) -> Option<String> {
        fs::read_to_string(self.ssh_config_path()).ok()
    }

    /// Backup files written next to the SSH config.
    pub fn backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.home.path().join(".ssh")) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.to_string_lossy().ends_with(".bak"))
            .collect();
        backups.sort();
        backups
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
