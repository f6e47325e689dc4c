//! Nodelink - allocate a compute node from a batch scheduler and wire SSH aliases to it.
//!
//! This library provides the core functionality for the `nodelink` CLI tool:
//! the SSH config reconciler ([`sshconfig`]), the streaming allocation session
//! ([`alloc`]) and the remote transport they run over ([`remote`]).

pub mod alloc;
pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod remote;
pub mod sshconfig;
pub mod sys;

use std::path::PathBuf;

/// Library-level error type for Nodelink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("Cannot reach {target}: {detail}")]
    Connectivity { target: String, detail: String },

    #[error("Failed to start remote command: {0}")]
    Transport(String),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Failed to write {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to back up {}: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    ConfigParse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Nodelink operations.
pub type Result<T> = std::result::Result<T, Error>;
