//! Nodelink CLI - allocate a compute node and reach it over SSH.

use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser};
use nodelink::alloc::{CancelToken, SessionMode};
use nodelink::cli::{Cli, Commands, ConfigCommands};
use nodelink::commands::{self, AllocOptions, Output};
use nodelink::config::{ConfigOverrides, ResolvedSettings, default_config_path, load_config, resolve_settings};
use nodelink::errors;
use nodelink::remote::SshExec;
use nodelink::sys::current_local_user;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
const LOG_ENV: &str = "NODELINK_LOG";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;
    init_logging(cli.verbose);

    if let Err(e) = run_command(cli.command, cli.config, human) {
        if human {
            eprintln!("{}", errors::render(&e));
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "nodelink=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolve settings: CLI overrides > config.kdl > system lookup > defaults.
fn load_settings(config: Option<PathBuf>, overrides: &ConfigOverrides) -> Result<ResolvedSettings, nodelink::Error> {
    let path = config.or_else(default_config_path);
    let file = match &path {
        Some(path) => load_config(path)?,
        None => None,
    };
    resolve_settings(file.as_ref(), path, overrides, current_local_user())
}

fn run_command(command: Option<Commands>, config: Option<PathBuf>, human: bool) -> Result<(), nodelink::Error> {
    match command {
        Some(Commands::Alloc(args)) => {
            let settings = load_settings(config, &args.overrides())?;
            let options = AllocOptions {
                mode: if args.interactive {
                    SessionMode::Interactive
                } else {
                    SessionMode::Foreground
                },
                update_ssh_config: !args.no_ssh_config,
            };

            let cancel = CancelToken::new();
            if options.mode == SessionMode::Foreground {
                cancel.install_interrupt_handler()?;
            }
            let result = commands::alloc(&settings, &SshExec::new(), &cancel, &options)?;
            output(&result, human);
        }
        Some(Commands::Repair(args)) => {
            let settings = load_settings(config, &args.target.overrides())?;
            output(&commands::repair(&settings)?, human);
        }
        Some(Commands::Clean(args)) => {
            let settings = load_settings(config, &args.target.overrides())?;
            output(&commands::clean(&settings)?, human);
        }
        Some(Commands::Config {
            command: ConfigCommands::Show,
        }) => {
            let settings = load_settings(config, &ConfigOverrides::default())?;
            output(&commands::config_show(&settings), human);
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }
    Ok(())
}

/// Print output in JSON or human-readable format.
fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
