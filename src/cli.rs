//! Command-line interface definitions for egress-warden.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Args, Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{Config, EnvironmentConfig, NetworkConfig, SessionConfig};
use crate::orchestrator::MountSpec;

/// Run a command with network egress limited to a domain allowlist.
///
/// The command runs in a container on an isolated network whose only way
/// out is a filtering proxy. DNS is limited to the configured resolvers.
/// Everything else is dropped.
#[derive(Parser, Debug)]
#[command(name = "egress-warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Subcommand to run (or omit to run a command).
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub policy: PolicyArgs,

    #[command(flatten)]
    pub run: RunArgs,

    /// Path to additional config file.
    ///
    /// Merged on top of system and user configs, below CLI flags.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Command to run, after `--`.
    #[arg(last = true, value_name = "COMMAND")]
    pub command_args: Vec<String>,
}

/// Egress policy flags.
#[derive(Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Domains to allow, comma-separated. `*.example.com` matches
    /// subdomains only.
    #[arg(long = "allow-domains", value_name = "DOMAINS")]
    pub allow_domains: Vec<String>,

    /// Domains to block, comma-separated. Blocks win over allows.
    #[arg(long = "block-domains", value_name = "DOMAINS")]
    pub block_domains: Vec<String>,

    /// HTTPS URL patterns to allow, comma-separated. Enables TLS
    /// interception for the hosts they name.
    #[arg(long = "allow-urls", value_name = "URLS")]
    pub allow_urls: Vec<String>,

    /// File with one allowed domain per line.
    #[arg(long = "allow-domains-file", value_name = "PATH")]
    pub allow_domains_file: Vec<PathBuf>,

    /// File with one blocked domain per line.
    #[arg(long = "block-domains-file", value_name = "PATH")]
    pub block_domains_file: Vec<PathBuf>,
}

impl PolicyArgs {
    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            allow: self.allow_domains.clone(),
            block: self.block_domains.clone(),
            allow_urls: self.allow_urls.clone(),
            allow_files: self.allow_domains_file.clone(),
            block_files: self.block_domains_file.clone(),
        }
    }

    /// These flags as a config layer.
    pub fn to_config(&self) -> Config {
        Config {
            network: self.network_config(),
            ..Default::default()
        }
    }
}

/// Session flags.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Bind mount `HOST:TARGET[:ro|rw]` (repeatable).
    #[arg(long = "mount", value_name = "HOST:TARGET[:MODE]")]
    pub mounts: Vec<MountSpec>,

    /// Environment variable `NAME=VALUE`, or `NAME` to copy it from the
    /// host (repeatable).
    #[arg(short = 'e', long = "env", value_name = "NAME[=VALUE]")]
    pub env: Vec<String>,

    /// Keep the workspace (access log, rendered rules) after the run.
    #[arg(long = "keep-workspace")]
    pub keep_workspace: bool,

    /// Keep containers, network and host rules after the run.
    #[arg(long = "keep-containers")]
    pub keep_containers: bool,

    /// Image for the proxy container.
    #[arg(long = "proxy-image", value_name = "IMAGE")]
    pub proxy_image: Option<String>,

    /// Image the command runs in.
    #[arg(long = "exec-image", value_name = "IMAGE")]
    pub exec_image: Option<String>,

    /// DNS resolvers the command may reach, comma-separated.
    #[arg(long = "dns-servers", value_name = "IPS", value_delimiter = ',')]
    pub dns_servers: Vec<Ipv4Addr>,
}

impl RunArgs {
    fn environment_config(&self) -> EnvironmentConfig {
        let mut environment = EnvironmentConfig::default();
        for entry in &self.env {
            match entry.split_once('=') {
                Some((name, value)) => {
                    environment.set.insert(name.to_string(), value.to_string());
                }
                None => environment.passthrough.push(entry.clone()),
            }
        }
        environment
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            proxy_image: self.proxy_image.clone(),
            exec_image: self.exec_image.clone(),
            dns_servers: self.dns_servers.clone(),
            keep_workspace: self.keep_workspace.then_some(true),
            ..Default::default()
        }
    }
}

impl Cli {
    /// The flags of a plain run as the highest-priority config layer.
    ///
    /// Mounts stay out of it: they are passed through as parsed.
    pub fn overrides(&self) -> Config {
        Config {
            network: self.policy.network_config(),
            session: self.run.session_config(),
            environment: self.run.environment_config(),
            mounts: Vec::new(),
        }
    }
}

/// Subcommands for egress-warden.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Remove resources left behind by earlier runs.
    ///
    /// By default only sessions whose owning process is gone are removed.
    Cleanup {
        /// Remove every session, including running ones.
        #[arg(long)]
        all: bool,

        /// List what would be removed without removing anything.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Explain how the policy decides a domain or URL.
    Check {
        /// Domain (`api.github.com`) or URL (`https://host/path`).
        target: String,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Summarize an access log.
    Logs {
        /// Access log or workspace directory. Defaults to the newest kept
        /// workspace.
        path: Option<PathBuf>,

        /// Only count denied requests.
        #[arg(long = "blocked-only")]
        blocked_only: bool,

        /// Show only the N busiest domains.
        #[arg(long, value_name = "N")]
        top: Option<usize>,

        /// Only domains containing this text.
        #[arg(long, value_name = "TEXT")]
        domain: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show the sessions on this host and what state they are in.
    ///
    /// Lists each session's containers, network, host chain and workspace,
    /// whether its owning process is alive and its proxy answers, and any
    /// resource a live session is missing.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,

        /// Include the last N lines of output of each container.
        #[arg(long, value_name = "N")]
        logs: Option<usize>,
    },

    /// Run the filtering proxy (hidden).
    ///
    /// Runs inside the proxy container and reads its rules from the
    /// mounted workspace.
    #[command(name = "internal-proxy", hide = true)]
    InternalProxy {
        /// Workspace directory holding the proxy rules.
        #[arg(long, required = true)]
        workspace: PathBuf,
    },

    /// Drop network capabilities and exec (hidden).
    ///
    /// Runs as PID 1 of the execution container.
    #[command(name = "internal-entrypoint", hide = true)]
    InternalEntrypoint {
        /// Command to exec.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Hold a network namespace open until signalled (hidden).
    ///
    /// Runs as PID 1 of the namespace holder container.
    #[command(name = "internal-pause", hide = true)]
    InternalPause,
}
