//! CLI argument definitions for Nodelink.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

/// Version string with the commit and build time baked in by build.rs.
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("NL_GIT_COMMIT"),
    " ",
    env!("NL_BUILD_TIMESTAMP"),
    ")"
);

/// Nodelink - allocate a compute node and reach it over SSH.
///
/// `nodelink alloc` requests a node from the cluster scheduler and writes a
/// `<cluster>-compute` alias into your SSH config for as long as the
/// allocation lives.
#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(author, version, long_version = LONG_VERSION, about = "Allocate a compute node and wire an SSH alias to it", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Log debug output to stderr (NODELINK_LOG takes precedence)
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Settings file to use instead of ~/.config/nodelink/config.kdl
    #[arg(long = "config", global = true, env = "NODELINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Allocate a compute node and keep it until interrupted or expired
    ///
    /// By default the allocation is held in the foreground and the SSH config
    /// gets a `<cluster>-compute` entry pointing at the granted node.
    /// Press Ctrl-C to cancel the job and release the node.
    Alloc(AllocArgs),

    /// Move catch-all `Host *` sections after specific ones in the SSH config
    Repair(SshConfigArgs),

    /// Remove the entries nodelink generated for a cluster from the SSH config
    Clean(SshConfigArgs),

    /// Settings management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Options for `alloc`
#[derive(Args, Debug, Default)]
pub struct AllocArgs {
    /// Remote username (defaults to the local user)
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Scheduler partition
    #[arg(short = 'p', long)]
    pub partition: Option<String>,

    /// Wall-clock limit (e.g. 04:00:00, 2-00:00:00, 90)
    #[arg(short = 't', long)]
    pub time: Option<String>,

    /// CPUs per task
    #[arg(short = 'c', long)]
    pub cpus: Option<u32>,

    /// Memory (e.g. 16G)
    #[arg(short = 'm', long = "mem")]
    pub memory: Option<String>,

    /// GPUs (GPU partitions default to 1; 0 requests none)
    #[arg(short = 'g', long)]
    pub gpus: Option<u32>,

    /// Open a shell on the node instead of holding the allocation
    #[arg(short = 'i', long)]
    pub interactive: bool,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Hostname the cluster alias points to when its entry has to be created
    #[arg(long)]
    pub head_host: Option<String>,

    /// Private key used for both the head and the compute entry
    #[arg(long)]
    pub identity_file: Option<String>,

    /// Do not touch the SSH config
    #[arg(long)]
    pub no_ssh_config: bool,
}

/// Options shared by commands that edit the SSH config
#[derive(Args, Debug, Default)]
pub struct SshConfigArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

/// Cluster alias and SSH config location
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// SSH alias of the cluster head node
    #[arg(long)]
    pub cluster: Option<String>,

    /// SSH config file to manage
    #[arg(long)]
    pub ssh_config: Option<String>,
}

/// Settings subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved settings and where each value came from
    Show,
}

impl TargetArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            cluster: self.cluster.clone(),
            ssh_config: self.ssh_config.clone(),
            ..Default::default()
        }
    }
}

impl AllocArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            head_host: self.head_host.clone(),
            user: self.user.clone(),
            partition: self.partition.clone(),
            time: self.time.clone(),
            cpus: self.cpus,
            memory: self.memory.clone(),
            gpus: self.gpus,
            identity_file: self.identity_file.clone(),
            ..self.target.overrides()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // This will panic if the CLI is misconfigured
        Cli::command().debug_assert();
    }

    #[test]
    fn test_alloc_flags() {
        let cli = Cli::try_parse_from([
            "nodelink", "-H", "alloc", "-u", "alice", "-p", "gpu", "-t", "02:00:00", "-c", "4", "-m", "16G", "-g",
            "2", "--cluster", "spider", "--no-ssh-config",
        ])
        .unwrap();

        assert!(cli.human_readable);
        let Some(Commands::Alloc(args)) = cli.command else {
            panic!("expected alloc");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.user.as_deref(), Some("alice"));
        assert_eq!(overrides.partition.as_deref(), Some("gpu"));
        assert_eq!(overrides.cpus, Some(4));
        assert_eq!(overrides.memory.as_deref(), Some("16G"));
        assert_eq!(overrides.gpus, Some(2));
        assert_eq!(overrides.cluster.as_deref(), Some("spider"));
        assert!(args.no_ssh_config);
        assert!(!args.interactive);
    }

    #[test]
    fn test_repair_takes_target() {
        let cli = Cli::try_parse_from(["nodelink", "repair", "--ssh-config", "/tmp/cfg"]).unwrap();
        let Some(Commands::Repair(args)) = cli.command else {
            panic!("expected repair");
        };
        assert_eq!(args.target.overrides().ssh_config.as_deref(), Some("/tmp/cfg"));
    }

    #[test]
    fn test_cpus_must_be_a_number() {
        assert!(Cli::try_parse_from(["nodelink", "alloc", "-c", "many"]).is_err());
    }
}
