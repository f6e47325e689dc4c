//! Reading, backing up and atomically replacing the SSH client config.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::document::ConfigDocument;
use super::reconcile::{self, HostEntryRequest};
use crate::{Error, Result};

/// File mode for the config and its backups (owner read/write only)
#[cfg(unix)]
pub const SSH_CONFIG_FILE_MODE: u32 = 0o600;

/// Backups kept per config file; older ones are removed after each write
pub const BACKUPS_KEPT: usize = 10;

/// Timestamp embedded in backup names
const BACKUP_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%3f";

/// Length of a [`BACKUP_STAMP_FORMAT`] timestamp
const BACKUP_STAMP_LEN: usize = 18;

/// Outcome of a store operation, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Config file that was operated on
    pub path: PathBuf,
    /// Whether a disordered wildcard section was moved
    pub repaired: bool,
    /// Whether the file content changed at all
    pub changed: bool,
    /// Backups written, oldest first
    pub backups: Vec<PathBuf>,
    /// Managed sections removed
    pub removed: usize,
    /// Whether a head-node section was generated
    pub head_added: bool,
}

/// An SSH client config file on disk.
#[derive(Debug, Clone)]
pub struct SshConfigFile {
    path: PathBuf,
}

impl SshConfigFile {
    /// Create a handle for the config at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file writes actually land in.
    ///
    /// A symlinked config (as set up by dotfile managers) resolves to its
    /// target, dangling or not, so the link itself is never replaced.
    pub fn resolved_path(&self) -> PathBuf {
        if let Ok(real) = fs::canonicalize(&self.path) {
            return real;
        }
        match fs::read_link(&self.path) {
            Ok(target) if target.is_relative() => match self.path.parent() {
                Some(parent) => parent.join(target),
                None => target,
            },
            Ok(target) => target,
            Err(_) => self.path.clone(),
        }
    }

    /// Read the raw content.
    ///
    /// # Returns
    /// * `Ok(Some(text))` if the file exists
    /// * `Ok(None)` if it doesn't
    pub fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write a timestamped copy of `content` next to the config.
    ///
    /// The backup is created with `create_new`, so an existing file is never
    /// overwritten; a numeric suffix is appended on collision.
    pub fn backup(&self, content: &str) -> Result<PathBuf> {
        let target = self.resolved_path();
        let stamp = Utc::now().format(BACKUP_STAMP_FORMAT).to_string();
        let file_name = backup_base_name(&target);

        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                format!("{}.nodelink-{}.bak", file_name, stamp)
            } else {
                format!("{}.nodelink-{}-{}.bak", file_name, stamp, attempt)
            };
            let backup_path = target.with_file_name(name);

            match create_private(&backup_path) {
                Ok(mut file) => {
                    let written = file
                        .write_all(content.as_bytes())
                        .and_then(|_| file.sync_all());
                    return match written {
                        Ok(()) => {
                            debug!(backup = %backup_path.display(), "wrote ssh config backup");
                            Ok(backup_path)
                        }
                        Err(source) => Err(Error::BackupFailed {
                            path: backup_path,
                            source,
                        }),
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(Error::BackupFailed {
                        path: backup_path,
                        source,
                    });
                }
            }
        }

        Err(Error::BackupFailed {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free backup file name"),
        })
    }

    /// Replace the config with `content` via a temp file in the same directory.
    ///
    /// The temp file gets mode 0600 and is fsynced before the rename, so
    /// readers see either the old or the new file, never a partial one.
    pub fn write_atomic(&self, content: &str) -> Result<()> {
        let target = self.resolved_path();
        write_replacing(&target, content).map_err(|source| Error::ConfigWrite { path: target, source })
    }

    /// Delete all but the newest `keep` backups of this config.
    pub fn prune_backups(&self, keep: usize) -> io::Result<usize> {
        let target = self.resolved_path();
        let dir = parent_dir(&target);
        let prefix = format!("{}.nodelink-", backup_base_name(&target));

        let mut backups = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let key = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| backup_order_key(n, &prefix));
            if let Some(key) = key {
                backups.push((key, path));
            }
        }
        backups.sort();

        let excess = backups.len().saturating_sub(keep);
        for (_, path) in backups.into_iter().take(excess) {
            fs::remove_file(&path)?;
            debug!(backup = %path.display(), "removed old ssh config backup");
        }
        Ok(excess)
    }

    /// Back up `previous` (if the file existed) and write `next`.
    fn replace(&self, previous: Option<&str>, next: &str, report: &mut ApplyReport) -> Result<()> {
        if let Some(previous) = previous {
            report.backups.push(self.backup(previous)?);
        }
        self.write_atomic(next)?;
        report.changed = true;
        if let Err(e) = self.prune_backups(BACKUPS_KEPT) {
            warn!(path = %self.path.display(), error = %e, "could not remove old ssh config backups");
        }
        Ok(())
    }

    /// Persist the ordering repair if the document needs one.
    ///
    /// Returns the (possibly repaired) content now on disk.
    fn repair_step(&self, report: &mut ApplyReport) -> Result<Option<String>> {
        let Some(current) = self.read()? else {
            return Ok(None);
        };

        let doc = ConfigDocument::parse(&current);
        match reconcile::repair_order(&doc) {
            Some(repaired) => {
                let repaired = repaired.to_string();
                info!(path = %self.path.display(), "moved wildcard Host sections to the end");
                self.replace(Some(&current), &repaired, report)?;
                report.repaired = true;
                Ok(Some(repaired))
            }
            None => Ok(Some(current)),
        }
    }

    /// Run only the ordering repair.
    pub fn repair(&self) -> Result<ApplyReport> {
        let mut report = self.report();
        self.repair_step(&mut report)?;
        Ok(report)
    }

    /// Repair ordering, then replace the managed entries for `request`.
    ///
    /// The repair is written on its own (with its own backup) before the
    /// managed entries are merged, so each step is recoverable from the
    /// backup taken just before it.
    pub fn apply(&self, request: &HostEntryRequest) -> Result<ApplyReport> {
        let mut report = self.report();
        let current = self.repair_step(&mut report)?;

        let doc = ConfigDocument::parse(current.as_deref().unwrap_or_default());
        let (next, summary) = reconcile::reconcile(&doc, request);
        let next = next.to_string();
        report.removed = summary.removed;
        report.head_added = summary.head_added;

        if current.as_deref() != Some(next.as_str()) {
            self.replace(current.as_deref(), &next, &mut report)?;
            info!(
                path = %self.path.display(),
                alias = %request.compute_alias(),
                node = %request.node,
                "updated ssh config"
            );
        }
        Ok(report)
    }

    /// Repair ordering, then drop every managed entry for `alias`.
    pub fn clean(&self, alias: &str) -> Result<ApplyReport> {
        let mut report = self.report();
        let Some(current) = self.repair_step(&mut report)? else {
            return Ok(report);
        };

        let (cleaned, removed) = reconcile::remove_managed(&ConfigDocument::parse(&current), alias);
        report.removed = removed;
        if removed > 0 {
            self.replace(Some(&current), &cleaned.to_string(), &mut report)?;
        }
        Ok(report)
    }

    fn report(&self) -> ApplyReport {
        ApplyReport {
            path: self.path.clone(),
            ..ApplyReport::default()
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn backup_base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string())
}

/// Sort key of a backup file name: its timestamp, then the collision suffix.
fn backup_order_key(name: &str, prefix: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(prefix)?.strip_suffix(".bak")?;
    let stamp = rest.get(..BACKUP_STAMP_LEN)?;
    if !stamp.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return None;
    }
    let attempt = match &rest[BACKUP_STAMP_LEN..] {
        "" => 0,
        suffix => suffix.strip_prefix('-')?.parse().ok()?,
    };
    Some((stamp.to_string(), attempt))
}

fn write_replacing(target: &Path, content: &str) -> io::Result<()> {
    let parent = parent_dir(target);
    if !parent.exists() {
        fs::create_dir_all(&parent)?;
        set_mode(&parent, 0o700)?;
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".nodelink-")
        .suffix(".tmp")
        .tempfile_in(&parent)?;
    tmp.write_all(content.as_bytes())?;
    #[cfg(unix)]
    set_mode(tmp.path(), SSH_CONFIG_FILE_MODE)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(SSH_CONFIG_FILE_MODE)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn request() -> HostEntryRequest {
        HostEntryRequest {
            alias: "cluster1".to_string(),
            head_host: "login.cluster1.example.org".to_string(),
            node: "node07".to_string(),
            user: "alice".to_string(),
            identity_file: "~/.ssh/id_ed25519".to_string(),
            generated_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".bak"))
            .collect();
        found.sort();
        found
    }

    #[test]
    fn test_read_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        let file = SshConfigFile::new(temp.path().join("config"));
        assert_eq!(file.read().unwrap(), None);
    }

    #[test]
    fn test_apply_creates_missing_file_without_backup() {
        let temp = TempDir::new().unwrap();
        let file = SshConfigFile::new(temp.path().join("ssh").join("config"));

        let report = file.apply(&request()).unwrap();

        assert!(report.changed);
        assert!(report.backups.is_empty());
        let text = file.read().unwrap().unwrap();
        assert!(text.contains("Host cluster1-compute\n"));
        assert!(text.contains("Host cluster1\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "Host a\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let report = SshConfigFile::new(&path).apply(&request()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let backup_mode = fs::metadata(&report.backups[0]).unwrap().permissions().mode() & 0o777;
        assert_eq!(backup_mode, 0o600);
    }

    #[test]
    fn test_apply_backs_up_previous_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "Host github.com\n    User git\n").unwrap();

        let report = SshConfigFile::new(&path).apply(&request()).unwrap();

        assert_eq!(report.backups.len(), 1);
        assert!(!report.repaired);
        assert_eq!(
            fs::read_to_string(&report.backups[0]).unwrap(),
            "Host github.com\n    User git\n"
        );
    }

    #[test]
    fn test_disordered_file_repaired_and_backed_up_first() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        let original = "Host *\n    ForwardAgent no\n\nHost myhost\n    User me\n";
        fs::write(&path, original).unwrap();

        let report = SshConfigFile::new(&path).apply(&request()).unwrap();

        assert!(report.repaired);
        assert_eq!(report.backups.len(), 2);
        assert_eq!(fs::read_to_string(&report.backups[0]).unwrap(), original);
        // Second backup holds the repaired document, before the merge.
        assert_eq!(
            fs::read_to_string(&report.backups[1]).unwrap(),
            "Host myhost\n    User me\n\nHost *\n    ForwardAgent no\n"
        );

        let doc = ConfigDocument::parse(&fs::read_to_string(&path).unwrap());
        let myhost = doc.sections.iter().position(|s| s.defines("myhost")).unwrap();
        assert!(myhost < doc.first_wildcard().unwrap());
        assert_eq!(backups_in(temp.path()).len(), 2);
    }

    #[test]
    fn test_second_apply_is_noop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        let file = SshConfigFile::new(&path);

        file.apply(&request()).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        let report = file.apply(&request()).unwrap();

        assert!(!report.changed);
        assert!(report.backups.is_empty());
        assert_eq!(report.removed, 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_repair_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "Host *\n    A 1\nHost b\n").unwrap();
        let file = SshConfigFile::new(&path);

        let report = file.repair().unwrap();
        assert!(report.repaired);
        assert_eq!(fs::read_to_string(&path).unwrap(), "Host b\n\nHost *\n    A 1\n");

        let again = file.repair().unwrap();
        assert!(!again.repaired);
        assert!(!again.changed);
        assert_eq!(backups_in(temp.path()).len(), 1);
    }

    #[test]
    fn test_repair_missing_file_is_noop() {
        let temp = TempDir::new().unwrap();
        let file = SshConfigFile::new(temp.path().join("config"));
        let report = file.repair().unwrap();
        assert!(!report.changed);
        assert!(!file.path().exists());
    }

    #[test]
    fn test_clean_removes_managed_family() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "Host github.com\n    User git\n").unwrap();
        let file = SshConfigFile::new(&path);
        file.apply(&request()).unwrap();

        let report = file.clean("cluster1").unwrap();

        assert_eq!(report.removed, 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "Host github.com\n    User git\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_backup_failure_leaves_file_untouched() {
        use std::os::unix::fs::PermissionsExt;

        // Root ignores directory permissions, so there is nothing to observe.
        if nix::unistd::geteuid().is_root() {
            return;
        }

        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ssh");
        fs::create_dir(&dir).unwrap();
        let path = dir.join("config");
        fs::write(&path, "Host a\n").unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o500)).unwrap();

        let result = SshConfigFile::new(&path).apply(&request());

        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(result, Err(Error::BackupFailed { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "Host a\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_config_updates_link_target() {
        let temp = TempDir::new().unwrap();
        let dotfiles = temp.path().join("dotfiles");
        let ssh_dir = temp.path().join("ssh");
        fs::create_dir(&dotfiles).unwrap();
        fs::create_dir(&ssh_dir).unwrap();
        let real = dotfiles.join("dotfiles_config");
        fs::write(&real, "Host github.com\n    User git\n").unwrap();
        let link = ssh_dir.join("config");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let report = SshConfigFile::new(&link).apply(&request()).unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(fs::read_to_string(&real).unwrap().contains("Host cluster1-compute\n"));
        assert_eq!(
            report.backups[0].parent().unwrap(),
            fs::canonicalize(&dotfiles).unwrap()
        );
        assert!(backups_in(&ssh_dir).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_creates_target() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("dotfiles_config");
        let link = temp.path().join("config");
        std::os::unix::fs::symlink("dotfiles_config", &link).unwrap();

        SshConfigFile::new(&link).apply(&request()).unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(fs::read_to_string(&real).unwrap().contains("Host cluster1\n"));
    }

    #[test]
    fn test_old_backups_are_pruned() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "Host a\n").unwrap();
        for i in 0..BACKUPS_KEPT + 2 {
            fs::write(temp.path().join(format!("config.nodelink-20200101-000000{:03}.bak", i)), "old").unwrap();
        }
        fs::write(temp.path().join("config.bak"), "hand made").unwrap();
        fs::write(temp.path().join("other.nodelink-20200101-000000000.bak"), "other").unwrap();

        let report = SshConfigFile::new(&path).apply(&request()).unwrap();

        let ours: Vec<PathBuf> = backups_in(temp.path())
            .into_iter()
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("config.nodelink-"))
            .collect();
        assert_eq!(ours.len(), BACKUPS_KEPT);
        let newest = report.backups[0].file_name().unwrap();
        assert!(ours.iter().any(|p| p.file_name() == Some(newest)));
        assert!(!temp.path().join("config.nodelink-20200101-000000000.bak").exists());
        assert!(!temp.path().join("config.nodelink-20200101-000000002.bak").exists());
        assert!(temp.path().join("config.nodelink-20200101-000000003.bak").exists());
        assert!(temp.path().join("config.bak").exists());
        assert!(temp.path().join("other.nodelink-20200101-000000000.bak").exists());
    }

    #[test]
    fn test_backup_order_key_puts_collisions_after_base_name() {
        let prefix = "config.nodelink-";
        let base = backup_order_key("config.nodelink-20260301-120000000.bak", prefix).unwrap();
        let second = backup_order_key("config.nodelink-20260301-120000000-1.bak", prefix).unwrap();
        let later = backup_order_key("config.nodelink-20260301-120000001.bak", prefix).unwrap();
        assert!(base < second);
        assert!(second < later);
        assert_eq!(backup_order_key("config.nodelink-junk.bak", prefix), None);
        assert_eq!(backup_order_key("config.bak", prefix), None);
    }

    #[test]
    fn test_backups_never_collide() {
        let temp = TempDir::new().unwrap();
        let file = SshConfigFile::new(temp.path().join("config"));
        let a = file.backup("one").unwrap();
        let b = file.backup("two").unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read_to_string(a).unwrap(), "one");
        assert_eq!(fs::read_to_string(b).unwrap(), "two");
    }
}
