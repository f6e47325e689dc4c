//! Command implementations for the Nodelink CLI.
//!
//! Each command takes resolved settings and returns a result value that
//! `main` prints as JSON or as human-readable text:
//! - `alloc` - allocate a node and wire the SSH alias to it
//! - `repair` - fix Host section ordering in the SSH config
//! - `clean` - remove generated SSH entries
//! - `config_show` - report resolved settings

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::alloc::{
    AllocationSession, AllocationState, CancelReport, CancelToken, RemoteCancel, SessionEnd, SessionMode,
    run_interactive,
};
use crate::config::ResolvedSettings;
use crate::errors;
use crate::remote::RemoteExec;
use crate::sshconfig::{ApplyReport, SshConfigFile, compute_alias};
use crate::sys;
use crate::{Error, Result};

/// Timeout for the connectivity probe run before allocating
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(20);

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

// ============================================================================
// alloc
// ============================================================================

/// How `alloc` should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocOptions {
    pub mode: SessionMode,
    /// Write the compute entry into the SSH config once the node is ready
    pub update_ssh_config: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            mode: SessionMode::Foreground,
            update_ssh_config: true,
        }
    }
}

/// How an allocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocOutcome {
    /// The scheduler ended the allocation (usually the time limit)
    Ended,
    /// Cancelled by the user
    Cancelled,
    /// The interactive shell exited
    ShellExited,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocResult {
    pub cluster: String,
    pub outcome: AllocOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// SSH alias of the compute node, when the config was updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<ApplyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether the scheduler confirmed the job cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_cancelled: Option<bool>,
}

impl AllocResult {
    fn new(cluster: &str, outcome: AllocOutcome) -> Self {
        Self {
            cluster: cluster.to_string(),
            outcome,
            job_id: None,
            node: None,
            compute_alias: None,
            ssh_config: None,
            exit_code: None,
            job_cancelled: None,
        }
    }
}

impl Output for AllocResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let job = self.job_id.as_deref().unwrap_or("(none)");
        match self.outcome {
            AllocOutcome::Ended => format!("Allocation {} on {} ended.", job, self.cluster),
            AllocOutcome::Cancelled => match self.job_cancelled {
                Some(false) => format!("Allocation {} interrupted; the job may still be running.", job),
                _ => format!("Allocation {} cancelled.", job),
            },
            AllocOutcome::ShellExited => format!(
                "Interactive session on {} exited with status {}.",
                self.cluster,
                self.exit_code
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ),
        }
    }
}

fn cancel_confirmed(report: &CancelReport) -> bool {
    !matches!(report.remote, RemoteCancel::Failed { .. })
}

/// Check everything that must be in place locally before contacting the cluster.
pub fn check_prerequisites<E: RemoteExec + ?Sized>(settings: &ResolvedSettings, exec: &E) -> Result<()> {
    settings.require_user()?;
    sys::check_identity_file(&settings.identity_path())?;
    if !exec.is_available() {
        return Err(Error::PrerequisiteMissing("ssh client not found in PATH".to_string()));
    }
    Ok(())
}

/// Verify that `target` accepts a non-interactive login.
pub fn check_connectivity<E: RemoteExec + ?Sized>(exec: &E, target: &str) -> Result<()> {
    let detail = match exec.exec_sync(target, "true", CONNECTIVITY_TIMEOUT) {
        Ok(output) if output.success() => return Ok(()),
        Ok(output) if !output.stderr.trim().is_empty() => output.stderr.trim().to_string(),
        Ok(output) => format!(
            "ssh exited with {}",
            output.exit.code.map_or("a signal".to_string(), |c| format!("code {}", c))
        ),
        Err(e) => e.to_string(),
    };
    Err(Error::Connectivity {
        target: target.to_string(),
        detail,
    })
}

/// Allocate a compute node.
///
/// In foreground mode this blocks until the allocation ends or `cancel` is
/// set; in interactive mode until the remote shell exits.
pub fn alloc<E: RemoteExec + ?Sized>(
    settings: &ResolvedSettings,
    exec: &E,
    cancel: &CancelToken,
    options: &AllocOptions,
) -> Result<AllocResult> {
    check_prerequisites(settings, exec)?;
    let cluster = settings.cluster.value.as_str();
    check_connectivity(exec, cluster)?;
    let request = settings.allocation_request(options.mode);

    if options.mode == SessionMode::Interactive {
        let exit = run_interactive(exec, cluster, &request)?;
        let mut result = AllocResult::new(cluster, AllocOutcome::ShellExited);
        result.exit_code = exit.code;
        return Ok(result);
    }

    eprintln!(
        "Requesting {} CPU(s), {} on partition {} for {}...",
        request.cpus, request.memory, request.partition, request.time_limit
    );
    let mut session = AllocationSession::start(exec, cluster, &request, cancel.clone())?;

    let (job_id, node) = match session.wait_ready().clone() {
        AllocationState::Ready(job_id, node) => (job_id, node),
        AllocationState::Failed(reason) => return Err(Error::AllocationFailed(reason)),
        AllocationState::Cancelled(job_id) => {
            let mut result = AllocResult::new(cluster, AllocOutcome::Cancelled);
            result.job_id = job_id.map(|j| j.to_string());
            result.job_cancelled = session.cancel_report().map(cancel_confirmed);
            return Ok(result);
        }
        other => {
            return Err(Error::Other(format!("allocation stopped in state {}", other.name())));
        }
    };

    let mut result = AllocResult::new(cluster, AllocOutcome::Ended);
    result.job_id = Some(job_id.to_string());
    result.node = Some(node.clone());

    if options.update_ssh_config {
        let store = SshConfigFile::new(settings.ssh_config_path());
        let applied = settings
            .host_entry_request(&node, Utc::now())
            .and_then(|entry| store.apply(&entry));
        match applied {
            Ok(report) => {
                let alias = compute_alias(cluster);
                info!(%alias, %node, path = %report.path.display(), "ssh config ready");
                eprintln!("Node {} is ready. Connect with: ssh {}", node, alias);
                result.compute_alias = Some(alias);
                result.ssh_config = Some(report);
            }
            Err(e) => {
                warn!(error = %e, "ssh config update failed, releasing allocation");
                session.cancel();
                return Err(e);
            }
        }
    } else {
        eprintln!("{}", errors::ssh_config_skipped(cluster, &node));
    }
    eprintln!("Holding allocation {}. Press Ctrl-C to release it.", job_id);

    match session.block_until_exit()? {
        SessionEnd::Exited(exit) => {
            result.exit_code = exit.code;
        }
        SessionEnd::Cancelled(report) => {
            result.outcome = AllocOutcome::Cancelled;
            result.job_cancelled = Some(cancel_confirmed(&report));
        }
    }
    Ok(result)
}

// ============================================================================
// repair / clean
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SshConfigAction {
    Repair,
    Clean,
}

#[derive(Debug, Clone, Serialize)]
pub struct SshConfigResult {
    pub action: SshConfigAction,
    pub cluster: String,
    #[serde(flatten)]
    pub report: ApplyReport,
}

impl Output for SshConfigResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let path = self.report.path.display();
        let mut lines = vec![match self.action {
            SshConfigAction::Repair if self.report.repaired => {
                format!("Moved catch-all Host sections to the end of {}.", path)
            }
            SshConfigAction::Repair => format!("{} is already in order.", path),
            SshConfigAction::Clean if self.report.removed > 0 => format!(
                "Removed {} nodelink entr{} for {} from {}.",
                self.report.removed,
                if self.report.removed == 1 { "y" } else { "ies" },
                self.cluster,
                path
            ),
            SshConfigAction::Clean => format!("No nodelink entries for {} in {}.", self.cluster, path),
        }];
        if self.action == SshConfigAction::Clean && self.report.repaired {
            lines.push("Catch-all Host sections were moved to the end first.".to_string());
        }
        for backup in &self.report.backups {
            lines.push(format!("  backup: {}", backup.display()));
        }
        lines.join("\n")
    }
}

/// Run only the ordering repair on the SSH config.
pub fn repair(settings: &ResolvedSettings) -> Result<SshConfigResult> {
    let report = SshConfigFile::new(settings.ssh_config_path()).repair()?;
    Ok(SshConfigResult {
        action: SshConfigAction::Repair,
        cluster: settings.cluster.value.clone(),
        report,
    })
}

/// Remove every managed entry for the configured cluster alias.
pub fn clean(settings: &ResolvedSettings) -> Result<SshConfigResult> {
    let cluster = settings.cluster.value.clone();
    let report = SshConfigFile::new(settings.ssh_config_path()).clean(&cluster)?;
    Ok(SshConfigResult {
        action: SshConfigAction::Clean,
        cluster,
        report,
    })
}

// ============================================================================
// config show
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SettingsResult {
    #[serde(flatten)]
    pub settings: ResolvedSettings,
}

impl Output for SettingsResult {
    fn to_human(&self) -> String {
        let s = &self.settings;
        let mut lines = vec![match &s.config_file {
            Some(path) => format!("Settings file: {}", path.display()),
            None => "Settings file: (none)".to_string(),
        }];
        let mut row = |key: &str, value: String, source: String| {
            lines.push(format!("  {:<14} {:<32} ({})", key, value, source));
        };
        row("cluster", s.cluster.value.clone(), s.cluster.source.to_string());
        row("head-host", s.head_host.value.clone(), s.head_host.source.to_string());
        match &s.user {
            Some(user) => row("user", user.value.clone(), user.source.to_string()),
            None => row("user", "(unknown)".to_string(), "unset".to_string()),
        }
        row("partition", s.partition.value.clone(), s.partition.source.to_string());
        row("time", s.time.value.clone(), s.time.source.to_string());
        row("cpus", s.cpus.value.to_string(), s.cpus.source.to_string());
        row("memory", s.memory.value.clone(), s.memory.source.to_string());
        match &s.gpus {
            Some(gpus) => row("gpus", gpus.value.to_string(), gpus.source.to_string()),
            None => row("gpus", "(by partition)".to_string(), "default".to_string()),
        }
        row("identity-file", s.identity_file.value.clone(), s.identity_file.source.to_string());
        row("ssh-config", s.ssh_config.value.clone(), s.ssh_config.source.to_string());
        lines.join("\n")
    }

    fn to_json(&self) -> String {
        json(self)
    }
}

/// Report resolved settings with their sources.
pub fn config_show(settings: &ResolvedSettings) -> SettingsResult {
    SettingsResult {
        settings: settings.clone(),
    }
}
