//! Settings for Nodelink.
//!
//! ## config.kdl - User preferences
//!
//! Located at `~/.config/nodelink/config.kdl` unless `--config` (or
//! `NODELINK_CONFIG`) points elsewhere. It holds the cluster alias, the
//! default resource request and the paths of the identity file and SSH
//! config. See [`schema`] for the keys.
//!
//! ## Precedence
//!
//! CLI flag > config.kdl > system lookup (username) > defaults.
//! Use the [`resolver`] module for resolution with source tracking.

pub mod resolver;
pub mod schema;

pub use resolver::{
    ConfigOverrides, Resolved, ResolvedSettings, ValueSource, default_config_path, load_config, resolve_settings,
};
pub use schema::NodelinkConfig;
