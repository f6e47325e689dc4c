//! Precedence resolution for settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. config.kdl
//! 3. System lookup (username only)
//! 4. Built-in defaults

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::schema::{NodelinkConfig, validate_word};
use crate::alloc::{AllocationRequest, SessionMode};
use crate::sshconfig::HostEntryRequest;
use crate::sys::expand_tilde;
use crate::{Error, Result};

pub const DEFAULT_CLUSTER: &str = "cluster";
pub const DEFAULT_PARTITION: &str = "cpu";
pub const DEFAULT_TIME_LIMIT: &str = "01:00:00";
pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_MEMORY: &str = "4G";
pub const DEFAULT_IDENTITY_FILE: &str = "~/.ssh/id_ed25519";
pub const DEFAULT_SSH_CONFIG: &str = "~/.ssh/config";

/// Job name given to every allocation.
pub const JOB_NAME: &str = "nodelink";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from config.kdl
    File,
    /// Looked up from the operating system
    System,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::File => write!(f, "file"),
            ValueSource::System => write!(f, "system"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// CLI overrides for settings resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cluster: Option<String>,
    pub head_host: Option<String>,
    pub user: Option<String>,
    pub partition: Option<String>,
    pub time: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub gpus: Option<u32>,
    pub identity_file: Option<String>,
    pub ssh_config: Option<String>,
}

/// Fully resolved settings with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSettings {
    /// Settings file that was consulted, if it existed
    pub config_file: Option<PathBuf>,
    pub cluster: Resolved<String>,
    pub head_host: Resolved<String>,
    pub user: Option<Resolved<String>>,
    pub partition: Resolved<String>,
    pub time: Resolved<String>,
    pub cpus: Resolved<u32>,
    pub memory: Resolved<String>,
    pub gpus: Option<Resolved<u32>>,
    pub identity_file: Resolved<String>,
    pub ssh_config: Resolved<String>,
}

impl ResolvedSettings {
    /// The remote username.
    ///
    /// # Errors
    /// Returns [`Error::PrerequisiteMissing`] if none was configured and the
    /// system lookup failed.
    pub fn require_user(&self) -> Result<&str> {
        self.user.as_ref().map(|u| u.value.as_str()).ok_or_else(|| {
            Error::PrerequisiteMissing("could not determine the remote username; pass --user".to_string())
        })
    }

    /// Identity file with `~` expanded.
    pub fn identity_path(&self) -> PathBuf {
        expand_tilde(&self.identity_file.value)
    }

    /// SSH config file with `~` expanded.
    pub fn ssh_config_path(&self) -> PathBuf {
        expand_tilde(&self.ssh_config.value)
    }

    /// Resource request for the scheduler.
    pub fn allocation_request(&self, mode: SessionMode) -> AllocationRequest {
        AllocationRequest {
            partition: self.partition.value.clone(),
            time_limit: self.time.value.clone(),
            cpus: self.cpus.value,
            memory: self.memory.value.clone(),
            gpus: self.gpus.as_ref().map(|g| g.value),
            mode,
            job_name: JOB_NAME.to_string(),
        }
    }

    /// SSH entries for `node`, stamped with `generated_at`.
    pub fn host_entry_request(&self, node: &str, generated_at: DateTime<Utc>) -> Result<HostEntryRequest> {
        Ok(HostEntryRequest {
            alias: self.cluster.value.clone(),
            head_host: self.head_host.value.clone(),
            node: node.to_string(),
            user: self.require_user()?.to_string(),
            identity_file: self.identity_file.value.clone(),
            generated_at,
        })
    }
}

/// Default settings file location: `~/.config/nodelink/config.kdl`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("nodelink").join("config.kdl"))
}

/// Load config.kdl from `path`; a missing file yields empty settings.
pub fn load_config(path: &Path) -> Result<Option<NodelinkConfig>> {
    match std::fs::read_to_string(path) {
        Ok(text) => NodelinkConfig::parse(&text)
            .map(Some)
            .map_err(|e| match e {
                Error::ConfigParse(msg) => Error::ConfigParse(format!("{}: {}", path.display(), msg)),
                other => other,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::ConfigParse(format!("{}: {}", path.display(), e))),
    }
}

fn pick<T: Clone>(cli: &Option<T>, file: &Option<T>, default: T) -> Resolved<T> {
    pick_optional(cli, file).unwrap_or(Resolved::new(default, ValueSource::Default))
}

fn pick_optional<T: Clone>(cli: &Option<T>, file: &Option<T>) -> Option<Resolved<T>> {
    if let Some(value) = cli {
        Some(Resolved::new(value.clone(), ValueSource::CliFlag))
    } else {
        file.as_ref().map(|value| Resolved::new(value.clone(), ValueSource::File))
    }
}

fn validate_overrides(overrides: &ConfigOverrides) -> Result<()> {
    let cli = NodelinkConfig {
        cluster: overrides.cluster.clone(),
        head_host: overrides.head_host.clone(),
        user: overrides.user.clone(),
        partition: overrides.partition.clone(),
        time: overrides.time.clone(),
        cpus: overrides.cpus,
        memory: overrides.memory.clone(),
        gpus: overrides.gpus,
        identity_file: overrides.identity_file.clone(),
        ssh_config: overrides.ssh_config.clone(),
    };
    cli.validate().map_err(Error::InvalidInput)
}

/// Resolve settings with the full precedence chain.
///
/// `system_user` is the local account name, used when neither the CLI nor
/// the file names a user.
pub fn resolve_settings(
    file: Option<&NodelinkConfig>,
    config_file: Option<PathBuf>,
    overrides: &ConfigOverrides,
    system_user: Option<String>,
) -> Result<ResolvedSettings> {
    validate_overrides(overrides)?;
    let empty = NodelinkConfig::default();
    let file_values = file.unwrap_or(&empty);

    let cluster = pick(&overrides.cluster, &file_values.cluster, DEFAULT_CLUSTER.to_string());
    // Without an explicit address the head entry points at the alias name.
    let head_host = pick_optional(&overrides.head_host, &file_values.head_host)
        .unwrap_or_else(|| Resolved::new(cluster.value.clone(), ValueSource::Default));
    let user = pick_optional(&overrides.user, &file_values.user).or_else(|| {
        system_user
            .filter(|u| validate_word("user", u).is_ok())
            .map(|u| Resolved::new(u, ValueSource::System))
    });

    let settings = ResolvedSettings {
        config_file: file.and(config_file),
        head_host,
        user,
        partition: pick(&overrides.partition, &file_values.partition, DEFAULT_PARTITION.to_string()),
        time: pick(&overrides.time, &file_values.time, DEFAULT_TIME_LIMIT.to_string()),
        cpus: pick(&overrides.cpus, &file_values.cpus, DEFAULT_CPUS),
        memory: pick(&overrides.memory, &file_values.memory, DEFAULT_MEMORY.to_string()),
        gpus: pick_optional(&overrides.gpus, &file_values.gpus),
        identity_file: pick(
            &overrides.identity_file,
            &file_values.identity_file,
            DEFAULT_IDENTITY_FILE.to_string(),
        ),
        ssh_config: pick(&overrides.ssh_config, &file_values.ssh_config, DEFAULT_SSH_CONFIG.to_string()),
        cluster,
    };

    Ok(settings)
}
