//! Standardized diagnostics.
//!
//! Every fatal error printed for a human follows the format:
//! ```text
//! nodelink: error: <category>: <brief>
//!
//!   <details>
//!
//!   <suggestion>
//! ```
//! Recoverable problems use the same layout with `warning` in place of
//! `error` and no suggestion block.

use std::fmt::Write;
use std::path::Path;

use crate::Error;
use crate::alloc::JobId;

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing local tools or files
    Prerequisite,
    /// The head node could not be reached
    Connectivity,
    /// The scheduler refused or abandoned the allocation
    Allocation,
    /// Reading, backing up or writing the SSH config
    SshConfig,
    /// The tool's own settings file or command-line values
    Settings,
    /// Unexpected failures
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prerequisite => write!(f, "prerequisite"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::Allocation => write!(f, "allocation"),
            Self::SshConfig => write!(f, "ssh-config"),
            Self::Settings => write!(f, "settings"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

fn push_block(msg: &mut String, block: &str) {
    msg.push_str("\n\n");
    for line in block.lines() {
        let _ = writeln!(msg, "  {}", line);
    }
    if msg.ends_with('\n') {
        msg.pop();
    }
}

/// Format a standardized error message.
pub fn format_error(category: ErrorCategory, brief: &str, details: Option<&str>, suggestion: Option<&str>) -> String {
    let mut msg = format!("nodelink: error: {}: {}", category, brief);
    if let Some(details) = details {
        push_block(&mut msg, details);
    }
    if let Some(suggestion) = suggestion {
        push_block(&mut msg, suggestion);
    }
    msg
}

/// Format a standardized warning message.
pub fn format_warning(category: ErrorCategory, brief: &str, details: Option<&str>) -> String {
    let mut msg = format!("nodelink: warning: {}: {}", category, brief);
    if let Some(details) = details {
        push_block(&mut msg, details);
    }
    msg
}

// ============================================================================
// Catalog
// ============================================================================

/// Render a fatal error with its remediation hint.
pub fn render(err: &Error) -> String {
    match err {
        Error::PrerequisiteMissing(what) => format_error(
            ErrorCategory::Prerequisite,
            what,
            None,
            Some(
                "Install an OpenSSH client and make sure the identity file exists,\n\
                 or point to another key with --identity-file.",
            ),
        ),
        Error::Connectivity { target, detail } => connectivity_failed(target, detail),
        Error::Transport(detail) => format_error(
            ErrorCategory::Connectivity,
            "failed to start remote command",
            Some(detail),
            Some("Check that `ssh` is installed and on PATH."),
        ),
        Error::AllocationFailed(reason) => format_error(
            ErrorCategory::Allocation,
            reason,
            None,
            Some(
                "Check the scheduler output above. Partition limits, time limits\n\
                 and resource requests are the usual causes.",
            ),
        ),
        Error::ConfigWrite { path, source } => ssh_config_failed("failed to write SSH config", path, source),
        Error::BackupFailed { path, source } => format_error(
            ErrorCategory::SshConfig,
            "failed to back up SSH config",
            Some(&format!("{}: {}", path.display(), source)),
            Some("The SSH config was left untouched. Fix the directory permissions and retry."),
        ),
        Error::ConfigParse(detail) => format_error(
            ErrorCategory::Settings,
            "invalid settings file",
            Some(detail),
            Some("Check for missing quotes or unknown keys. `nodelink config show` prints the resolved values."),
        ),
        Error::InvalidInput(detail) => format_error(ErrorCategory::Settings, detail, None, None),
        Error::Io(e) => format_error(ErrorCategory::Internal, &e.to_string(), None, None),
        Error::Json(e) => format_error(ErrorCategory::Internal, &e.to_string(), None, None),
        Error::Other(msg) => format_error(ErrorCategory::Internal, msg, None, None),
    }
}

/// Error: the head node did not answer the connectivity probe
pub fn connectivity_failed(target: &str, detail: &str) -> String {
    format_error(
        ErrorCategory::Connectivity,
        &format!("cannot reach {}", target),
        Some(detail),
        Some(&format!(
            "Test the connection manually with:\n  ssh {} true\n\
             Key-based authentication must work without a password prompt.",
            target
        )),
    )
}

fn ssh_config_failed(brief: &str, path: &Path, source: &std::io::Error) -> String {
    format_error(
        ErrorCategory::SshConfig,
        brief,
        Some(&format!("{}: {}", path.display(), source)),
        Some("A backup of the previous content sits next to the file."),
    )
}

/// Warning: the job could not be cancelled on the cluster
pub fn remote_cancel_failed(target: &str, job_id: &JobId, detail: &str) -> String {
    format_warning(
        ErrorCategory::Allocation,
        &format!("could not cancel job {}", job_id),
        Some(&format!(
            "{}\n\nThe job may still be holding resources. Cancel it manually with:\n  ssh {} scancel {}",
            detail, target, job_id
        )),
    )
}

/// Warning: the SSH config was not updated after a successful allocation
pub fn ssh_config_skipped(alias: &str, node: &str) -> String {
    format_warning(
        ErrorCategory::SshConfig,
        "SSH config left unchanged",
        Some(&format!(
            "Connect to the node through the head alias instead:\n  ssh -J {} {}",
            alias, node
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_format_error_basic() {
        let msg = format_error(ErrorCategory::Settings, "test brief", None, None);
        assert_eq!(msg, "nodelink: error: settings: test brief");
    }

    #[test]
    fn test_format_error_blocks_are_indented() {
        let msg = format_error(
            ErrorCategory::Allocation,
            "brief",
            Some("detail line 1\ndetail line 2"),
            Some("suggestion"),
        );
        assert_eq!(
            msg,
            "nodelink: error: allocation: brief\n\n  detail line 1\n  detail line 2\n\n  suggestion"
        );
    }

    #[test]
    fn test_format_warning() {
        let msg = format_warning(ErrorCategory::SshConfig, "skipped", Some("why"));
        assert_eq!(msg, "nodelink: warning: ssh-config: skipped\n\n  why");
    }

    #[test]
    fn test_connectivity_includes_manual_test_command() {
        let err = Error::Connectivity {
            target: "cluster1".to_string(),
            detail: "Permission denied (publickey).".to_string(),
        };
        let msg = render(&err);
        assert!(msg.starts_with("nodelink: error: connectivity: cannot reach cluster1"));
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("ssh cluster1 true"));
    }

    #[test]
    fn test_remote_cancel_failed_has_manual_recovery() {
        let msg = remote_cancel_failed("cluster1", &JobId::from("77"), "connection reset");
        assert!(msg.starts_with("nodelink: warning: allocation: could not cancel job 77"));
        assert!(msg.contains("ssh cluster1 scancel 77"));
    }

    #[test]
    fn test_backup_failure_says_config_untouched() {
        let err = Error::BackupFailed {
            path: PathBuf::from("/home/a/.ssh/config.nodelink-1.bak"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = render(&err);
        assert!(msg.contains("failed to back up SSH config"));
        assert!(msg.contains("left untouched"));
    }

    #[test]
    fn test_prerequisite_render() {
        let msg = render(&Error::PrerequisiteMissing("identity file /x not found".to_string()));
        assert!(msg.starts_with("nodelink: error: prerequisite: identity file /x not found"));
        assert!(msg.contains("--identity-file"));
    }
}
