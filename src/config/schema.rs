//! KDL schema for `config.kdl`.
//!
//! ```kdl
//! cluster "cluster1"
//! head-host "login.cluster1.example.org"
//! user "alice"
//! partition "gpu"
//! time "04:00:00"
//! cpus 8
//! memory "32G"
//! gpus 1
//! identity-file "~/.ssh/id_ed25519"
//! ssh-config "~/.ssh/config"
//! ```
//!
//! Every key is optional. Unknown keys and values of the wrong type are
//! rejected so typos do not silently fall back to defaults.

use std::sync::LazyLock;

use kdl::{KdlDocument, KdlValue};
use regex::Regex;
use serde::Serialize;

use crate::{Error, Result};

/// Scheduler time limit: `MM`, `MM:SS`, `HH:MM:SS`, optionally `D-` prefixed.
static TIME_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+-)?\d+(?::\d+){0,2}$").expect("time limit regex is valid"));

/// Memory request: digits with an optional K/M/G/T suffix.
static MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[KMGTkmgt]?$").expect("memory regex is valid"));

const KNOWN_KEYS: &[&str] = &[
    "cluster",
    "head-host",
    "user",
    "partition",
    "time",
    "cpus",
    "memory",
    "gpus",
    "identity-file",
    "ssh-config",
];

/// User settings stored in config.kdl.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodelinkConfig {
    /// SSH alias of the cluster head node
    pub cluster: Option<String>,
    /// Real hostname behind the alias, used when the head entry is created
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

impl NodelinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config text.
    ///
    /// # Errors
    /// Returns [`Error::ConfigParse`] for KDL syntax errors, unknown keys,
    /// wrongly typed values and values that fail [`NodelinkConfig::validate`].
    pub fn parse(text: &str) -> Result<Self> {
        let doc: KdlDocument = text
            .parse()
            .map_err(|e: kdl::KdlError| Error::ConfigParse(e.to_string()))?;
        let config = Self::from_kdl(&doc).map_err(Error::ConfigParse)?;
        config.validate().map_err(Error::ConfigParse)?;
        Ok(config)
    }

    /// Read config values from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> std::result::Result<Self, String> {
        if let Some(unknown) = doc
            .nodes()
            .iter()
            .map(|n| n.name().value())
            .find(|name| !KNOWN_KEYS.contains(name))
        {
            return Err(format!("unknown key '{}'", unknown));
        }

        Ok(Self {
            cluster: string_value(doc, "cluster")?,
            head_host: string_value(doc, "head-host")?,
            user: string_value(doc, "user")?,
            partition: string_value(doc, "partition")?,
            time: string_value(doc, "time")?,
            cpus: count_value(doc, "cpus")?,
            memory: string_value(doc, "memory")?,
            gpus: count_value(doc, "gpus")?,
            identity_file: string_value(doc, "identity-file")?,
            ssh_config: string_value(doc, "ssh-config")?,
        })
    }

    /// Validate the config values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cpus == Some(0) {
            return Err("cpus must be at least 1".to_string());
        }
        if let Some(time) = &self.time {
            validate_time_limit(time)?;
        }
        if let Some(memory) = &self.memory {
            validate_memory(memory)?;
        }
        if let Some(identity_file) = &self.identity_file {
            validate_identity_file(identity_file)?;
        }
        for (key, value) in [
            ("cluster", &self.cluster),
            ("head-host", &self.head_host),
            ("user", &self.user),
            ("partition", &self.partition),
        ] {
            if let Some(value) = value {
                validate_word(key, value)?;
            }
        }
        Ok(())
    }
}

fn first_value<'a>(doc: &'a KdlDocument, key: &str) -> Option<&'a KdlValue> {
    doc.get(key)?.entries().first().map(|entry| entry.value())
}

fn string_value(doc: &KdlDocument, key: &str) -> std::result::Result<Option<String>, String> {
    match first_value(doc, key) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| format!("'{}' must be a string", key)),
    }
}

fn count_value(doc: &KdlDocument, key: &str) -> std::result::Result<Option<u32>, String> {
    match first_value(doc, key) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| format!("'{}' must be a non-negative integer", key)),
    }
}

/// Check a scheduler time limit (`30`, `30:00`, `04:00:00`, `2-00:00:00`).
pub fn validate_time_limit(value: &str) -> std::result::Result<(), String> {
    if TIME_LIMIT_RE.is_match(value) {
        Ok(())
    } else {
        Err(format!(
            "invalid time limit '{}' (expected MM, MM:SS, HH:MM:SS or D-HH:MM:SS)",
            value
        ))
    }
}

/// Check a memory request such as `4G` or `512M`.
pub fn validate_memory(value: &str) -> std::result::Result<(), String> {
    if MEMORY_RE.is_match(value) {
        Ok(())
    } else {
        Err(format!("invalid memory '{}' (expected a number with K, M, G or T suffix)", value))
    }
}

/// Identity paths may contain spaces but must fit in one quoted directive.
pub fn validate_identity_file(value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() || value.chars().any(|c| c == '"' || c.is_control()) {
        Err(format!("invalid identity-file '{}'", value.escape_default()))
    } else {
        Ok(())
    }
}

/// Names end up in SSH config directives and remote command lines.
pub fn validate_word(key: &str, value: &str) -> std::result::Result<(), String> {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '#' || c == '"') {
        Err(format!("invalid {} '{}'", key, value))
    } else {
        Ok(())
    }
}
