//! egress-warden: run a command with network egress limited to a domain
//! allowlist.
//!
//! This is the main entry point for the egress-warden binary. It handles CLI
//! argument parsing, logging and telemetry initialization, and dispatches to
//! the run or a subcommand.
//!
//! # I/O Architecture
//!
//! The wrapped command owns stdin/stdout/stderr once it starts:
//!
//! - **Audit logging**: goes to syslog, never to the terminal
//! - **Debug logging**: goes to stderr, and is quiet at the default level
//! - **Diagnostics**: a firewall failure prints one line naming the failed
//!   layer and exits with the reserved code

use anyhow::{Context, Result};
use clap::Parser;
use egress_warden::{
    cli::{Cli, Commands},
    cli_handler, telemetry,
};
use tracing::{debug, warn};

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    // The hidden subcommands run inside containers, where syslog is usually
    // absent. Audit events come from the host side.
    if !matches!(
        cli.command,
        Some(
            Commands::InternalProxy { .. }
                | Commands::InternalEntrypoint { .. }
                | Commands::InternalPause
        )
    ) && let Err(e) = telemetry::init_logger()
    {
        warn!("Audit logging disabled: {}", e);
    }

    let code = match cli.command {
        Some(command) => cli_handler::handle_command(command, cli.config.as_deref())?,
        None => cli_handler::run_command(&cli)?,
    };

    std::process::exit(code)
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
