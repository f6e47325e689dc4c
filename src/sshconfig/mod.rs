//! SSH client configuration management.
//!
//! Parsing and serialization live in [`document`], the pure merge rules in
//! [`reconcile`], and everything that touches the filesystem in [`store`].

pub mod document;
pub mod reconcile;
pub mod store;

pub use document::{ConfigDocument, ConfigSection, LineEnding, MANAGED_MARKER};
pub use reconcile::{
    HostEntryRequest, ReconcileSummary, compute_alias, is_ordered, reconcile, remove_managed, repair_order,
};
pub use store::{ApplyReport, SshConfigFile};
