//! Pure transformations over a [`ConfigDocument`].
//!
//! Nothing here touches the filesystem; [`super::store`] wraps these functions
//! with read, backup and atomic write.

use chrono::{DateTime, SecondsFormat, Utc};

use super::document::{ConfigDocument, ConfigSection, MANAGED_MARKER};

/// Keep-alive interval written into generated sections (seconds)
pub const SERVER_ALIVE_INTERVAL: u32 = 60;

/// Missed keep-alives tolerated before the client disconnects
pub const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// Indentation used for generated directive lines
const INDENT: &str = "    ";

/// Inputs for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntryRequest {
    /// Head-node alias (e.g. `cluster1`); the compute alias is derived from it
    pub alias: String,
    /// Address the head alias points to
    pub head_host: String,
    /// Compute node assigned by the scheduler
    pub node: String,
    /// Remote username
    pub user: String,
    /// Identity file as it should appear in the config (may start with `~`)
    pub identity_file: String,
    /// Timestamp recorded in the managed marker
    pub generated_at: DateTime<Utc>,
}

impl HostEntryRequest {
    /// Alias of the generated compute-node entry.
    pub fn compute_alias(&self) -> String {
        compute_alias(&self.alias)
    }
}

/// Alias of the compute-node entry for a head alias.
pub fn compute_alias(alias: &str) -> String {
    format!("{}-compute", alias)
}

/// What [`reconcile`] did, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Managed sections removed before insertion
    pub removed: usize,
    /// Whether a head-node section was generated
    pub head_added: bool,
    /// Index of the first generated section in the result
    pub inserted_at: usize,
}

/// True if no catch-all section precedes a specific one.
pub fn is_ordered(doc: &ConfigDocument) -> bool {
    match doc.first_wildcard() {
        Some(first) => doc.sections[first..].iter().all(|s| s.is_wildcard),
        None => true,
    }
}

/// Move catch-all sections behind all specific ones.
///
/// Returns `None` when the document is already ordered. Relative order within
/// each group is preserved.
pub fn repair_order(doc: &ConfigDocument) -> Option<ConfigDocument> {
    if is_ordered(doc) {
        return None;
    }

    let (specific, wildcard): (Vec<_>, Vec<_>) =
        doc.sections.iter().cloned().partition(|s| !s.is_wildcard);

    let mut repaired = ConfigDocument {
        preamble: doc.preamble.clone(),
        sections: specific.into_iter().chain(wildcard).collect(),
        line_ending: doc.line_ending,
    };
    repaired.tidy_boundaries();
    Some(repaired)
}

/// Whether `section` is owned by this tool for the `alias` family.
///
/// Marked sections for the head or compute alias are owned, and so is an
/// unmarked `Host <alias>-compute`, since that name is reserved for generated
/// entries. An unmarked head-alias section is always user-authored.
pub fn is_managed_for(section: &ConfigSection, alias: &str) -> bool {
    let compute = compute_alias(alias);
    if section.managed {
        section.defines(alias) || section.defines(&compute)
    } else {
        section.is_exactly(&compute)
    }
}

/// Remove every managed section of the `alias` family.
///
/// Comments above an unmarked section were written by the user, so they are
/// moved to the end of the preceding block instead of being dropped.
/// Returns the cleaned document and how many sections were dropped.
pub fn remove_managed(doc: &ConfigDocument, alias: &str) -> (ConfigDocument, usize) {
    let mut cleaned = ConfigDocument {
        preamble: doc.preamble.clone(),
        sections: Vec::with_capacity(doc.sections.len()),
        line_ending: doc.line_ending,
    };
    let mut removed = 0;

    for section in &doc.sections {
        if !is_managed_for(section, alias) {
            cleaned.sections.push(section.clone());
            continue;
        }
        removed += 1;
        if !section.managed && !section.leading.is_empty() {
            let previous = match cleaned.sections.last_mut() {
                Some(kept) => &mut kept.body,
                None => &mut cleaned.preamble,
            };
            previous.extend(section.leading.iter().cloned());
        }
    }

    if removed > 0 {
        cleaned.tidy_boundaries();
    }
    (cleaned, removed)
}

/// Produce the new document for `request`.
///
/// Ordering is repaired first, then managed entries of the alias family are
/// replaced. The compute section always comes first; the head section is only
/// generated if no user-authored section defines the head alias. Both are
/// inserted before the first catch-all section, or appended.
pub fn reconcile(doc: &ConfigDocument, request: &HostEntryRequest) -> (ConfigDocument, ReconcileSummary) {
    let repaired = repair_order(doc);
    let ordered = repaired.as_ref().unwrap_or(doc);
    let (mut result, removed) = remove_managed(ordered, &request.alias);

    let head_added = result.sections_defining(&request.alias).next().is_none();
    let mut generated = vec![compute_section(request)];
    if head_added {
        generated.push(head_section(request));
    }

    if result.is_empty() {
        result.preamble = vec![
            "# SSH client configuration".to_string(),
            format!("# Created by nodelink on {}", marker_timestamp(request)),
        ];
    }

    let inserted_at = result.first_wildcard().unwrap_or(result.sections.len());
    for (offset, section) in generated.into_iter().enumerate() {
        result.sections.insert(inserted_at + offset, section);
    }
    result.tidy_boundaries();

    let summary = ReconcileSummary {
        removed,
        head_added,
        inserted_at,
    };
    (result, summary)
}

fn marker_timestamp(request: &HostEntryRequest) -> String {
    request.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn marker_line(request: &HostEntryRequest) -> String {
    format!("# {} generated={}", MANAGED_MARKER, marker_timestamp(request))
}

fn directive(key: &str, value: impl std::fmt::Display) -> String {
    format!("{}{} {}", INDENT, key, value)
}

/// Double-quote a path argument that contains whitespace.
fn path_argument(path: &str) -> String {
    if path.chars().any(char::is_whitespace) {
        format!("\"{}\"", path)
    } else {
        path.to_string()
    }
}

fn compute_section(request: &HostEntryRequest) -> ConfigSection {
    let alias = request.compute_alias();
    let body = vec![
        directive("HostName", &request.node),
        directive("User", &request.user),
        directive("ProxyJump", &request.alias),
        directive("IdentityFile", path_argument(&request.identity_file)),
        directive("ServerAliveInterval", SERVER_ALIVE_INTERVAL),
        directive("ServerAliveCountMax", SERVER_ALIVE_COUNT_MAX),
        directive("StrictHostKeyChecking", "no"),
        directive("UserKnownHostsFile", "/dev/null"),
    ];
    ConfigSection::new(
        vec![marker_line(request)],
        format!("Host {}", alias),
        vec![alias],
        body,
    )
}

fn head_section(request: &HostEntryRequest) -> ConfigSection {
    let body = vec![
        directive("HostName", &request.head_host),
        directive("User", &request.user),
        directive("IdentityFile", path_argument(&request.identity_file)),
        directive("ServerAliveInterval", SERVER_ALIVE_INTERVAL),
        directive("ServerAliveCountMax", SERVER_ALIVE_COUNT_MAX),
    ];
    ConfigSection::new(
        vec![marker_line(request)],
        format!("Host {}", request.alias),
        vec![request.alias.clone()],
        body,
    )
}
