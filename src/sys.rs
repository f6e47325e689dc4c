//! Host system lookups: the local user, home-relative paths and the tools
//! an allocation needs before it can start.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::{Error, Result};

/// Name of the user running this process.
///
/// Looks the effective uid up in the user database and falls back to the
/// `USER` / `LOGNAME` environment variables.
pub fn current_local_user() -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
            return Some(user.name);
        }
    }

    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.trim().is_empty())
}

/// Expand a leading `~` or `~/` to the home directory.
///
/// # Examples
///
/// ```
/// use nodelink::sys::expand_tilde;
///
/// assert_eq!(expand_tilde("/etc/ssh/ssh_config"), std::path::PathBuf::from("/etc/ssh/ssh_config"));
/// ```
pub fn expand_tilde(path: &str) -> PathBuf {
    let rest = match path {
        "~" => Some(""),
        p => p.strip_prefix("~/"),
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Whether an `ssh` client can be executed.
pub fn ssh_available() -> bool {
    let status = Command::new("ssh")
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!(?status, "ssh -V");
    status.is_ok()
}

/// Check that the private key exists.
///
/// # Errors
/// Returns [`Error::PrerequisiteMissing`] naming the missing file.
pub fn check_identity_file(identity_file: &Path) -> Result<()> {
    if identity_file.is_file() {
        Ok(())
    } else {
        Err(Error::PrerequisiteMissing(format!(
            "identity file {} not found",
            identity_file.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/.ssh/config"), home.join(".ssh/config"));
        assert_eq!(expand_tilde("~alice/x"), PathBuf::from("~alice/x"));
        assert_eq!(expand_tilde("relative/key"), PathBuf::from("relative/key"));
    }

    #[test]
    fn test_current_local_user_is_known() {
        let user = current_local_user();
        assert!(user.is_some_and(|u| !u.is_empty()));
    }

    #[test]
    fn test_missing_identity_file_is_prerequisite_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("id_ed25519");

        let err = check_identity_file(&missing).unwrap_err();
        assert!(matches!(err, Error::PrerequisiteMissing(msg) if msg.contains("id_ed25519")));
    }

    #[test]
    fn test_directory_is_not_an_identity_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            check_identity_file(dir.path()),
            Err(Error::PrerequisiteMissing(_))
        ));
    }
}
