//! Command handling for egress-warden.
//!
//! Every handler returns the process exit code. Engine failures are not
//! `Err`: they are reported on stderr with the failing layer and mapped to
//! [`FIREWALL_FAILURE_EXIT_CODE`], so a caller can tell "the firewall never
//! came up" apart from the command's own failure.

use anyhow::{Context, Result, bail};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, PolicyArgs};
use crate::config::{Config, ConfigLoader};
use crate::orchestrator::{
    DockerCli, EngineError, FIREWALL_FAILURE_EXIT_CODE, FailedLayer, IptablesFirewall,
    Orchestrator, RunRequest, StatusOptions, TcpChecker, status, wait_for_signal,
};
use crate::policy::Policy;
use crate::proxy::{ProxyListeners, ProxyServer};
use crate::sandbox::cleanup::{KeepPolicy, SweepScope, list_sessions};
use crate::sandbox::naming::RESOURCE_PREFIX;
use crate::sandbox::workspace::LOGS_DIR;
use crate::sandbox::{EntrypointError, entrypoint, find_host_ca_bundle};
use crate::telemetry::{ACCESS_LOG_FILE, AccessSummary, SummaryFilter, read_records};

/// Exit code when the command was found but could not be executed.
const EXEC_FAILED_EXIT_CODE: i32 = 126;

/// Exit code when the command does not exist in the image.
const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

/// Run `cli.command_args` under the egress policy.
pub fn run_command(cli: &Cli) -> Result<i32> {
    if cli.command_args.is_empty() {
        bail!("No command given. Usage: egress-warden [OPTIONS] -- <COMMAND>...");
    }

    let config = ConfigLoader::new()
        .load(cli.config.as_deref(), cli.overrides())
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    let policy = match compile_policy(&config) {
        Ok(policy) => policy,
        Err(e) => return Ok(report_engine_error(&e)),
    };
    let request = build_request(&config, cli, policy)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let orchestrator = Orchestrator::new(
        DockerCli::new().context("Container runtime not available")?,
        IptablesFirewall::default(),
        TcpChecker::default(),
    );

    match runtime.block_on(orchestrator.run(&request)) {
        Ok(outcome) => {
            for failure in &outcome.teardown.failures {
                warn!("Cleanup left {} behind: {}", failure.resource, failure.error);
            }
            if !outcome.teardown.kept.is_empty() {
                eprintln!(
                    "egress-warden: kept {} for session {}",
                    outcome.teardown.kept.join(", "),
                    outcome.session
                );
            }
            info!("Session {} exited with {}", outcome.session, outcome.exit_code);
            Ok(outcome.exit_code)
        }
        Err(e) => Ok(report_engine_error(&e)),
    }
}

/// Handle a subcommand.
pub fn handle_command(command: Commands, config_path: Option<&Path>) -> Result<i32> {
    match command {
        Commands::Cleanup { all, dry_run } => cleanup(all, dry_run),
        Commands::Check { target, policy } => check(&target, &policy, config_path),
        Commands::Logs {
            path,
            blocked_only,
            top,
            domain,
            json,
        } => {
            let filter = SummaryFilter {
                blocked_only,
                domain,
                top,
            };
            logs(path, &filter, json)
        }
        Commands::Status { json, logs } => show_status(json, logs, config_path),
        Commands::InternalProxy { workspace } => run_proxy(&workspace),
        Commands::InternalEntrypoint { command } => Ok(run_entrypoint(&command)),
        Commands::InternalPause => pause(),
    }
}

fn compile_policy(config: &Config) -> Result<Policy, EngineError> {
    Ok(config.policy_builder()?.build()?)
}

/// Assemble the run from merged config and the flags config cannot carry.
fn build_request(config: &Config, cli: &Cli, policy: Policy) -> Result<RunRequest> {
    let mut request = RunRequest::new(policy, cli.command_args.clone());
    let session = &config.session;

    request.topology = session.topology().context("Invalid network settings")?;
    if let Some(image) = &session.proxy_image {
        request.proxy_image = image.clone();
    }
    if let Some(image) = &session.exec_image {
        request.exec_image = image.clone();
    }
    if let Some(retries) = session.health_retries {
        request.health_retries = retries;
    }
    if let Some(interval) = session.health_interval() {
        request.health_interval = interval;
    }
    request.keep = KeepPolicy {
        workspace: session.keep_workspace.unwrap_or(false),
        containers: cli.run.keep_containers,
    };

    request.mounts = config.mount_specs();
    request.mounts.extend(cli.run.mounts.iter().cloned());
    request.env = config.environment.resolve(|name| std::env::var(name).ok());

    request.binary = std::env::current_exe().context("Failed to locate own executable")?;
    request.host_ca_bundle = find_host_ca_bundle().map(Path::to_path_buf);
    request.interactive = std::io::stdin().is_terminal();
    request.tty = request.interactive && std::io::stdout().is_terminal();

    Ok(request)
}

fn report_engine_error(err: &EngineError) -> i32 {
    eprintln!("egress-warden: firewall failed ({}): {}", err.layer(), err);
    err.exit_code()
}

fn cleanup(all: bool, dry_run: bool) -> Result<i32> {
    let scope = if all {
        SweepScope::All
    } else {
        SweepScope::Abandoned
    };
    let tmp_root = std::env::temp_dir();
    let runtime = DockerCli::new().context("Container runtime not available")?;
    let firewall = IptablesFirewall::default();

    if dry_run {
        let inventory = list_sessions(&runtime, &firewall, &tmp_root);
        let mut found = false;
        for (id, resources) in inventory.in_scope(scope) {
            found = true;
            println!("session {} ({} resources)", id, resources.count());
            for name in resources
                .containers
                .iter()
                .chain(&resources.networks)
                .chain(&resources.chains)
            {
                println!("  {}", name);
            }
            if let Some(workspace) = &resources.workspace {
                println!("  {}", workspace.display());
            }
        }
        if !found {
            println!("Nothing to clean up");
        }
        return Ok(0);
    }

    let orchestrator = Orchestrator::new(runtime, firewall, TcpChecker::default());
    let report = orchestrator.sweep(&tmp_root, scope);
    println!(
        "Removed {} resources from {} session(s)",
        report.teardown.removed.len(),
        report.sessions.len()
    );
    for failure in &report.teardown.failures {
        eprintln!("egress-warden: failed to remove {}", failure);
    }
    Ok(if report.teardown.is_clean() { 0 } else { 1 })
}

/// Exit code is 1 when any session with a live owner is unhealthy.
fn show_status(json: bool, log_lines: Option<usize>, config_path: Option<&Path>) -> Result<i32> {
    let config = ConfigLoader::new()
        .load(config_path, Config::default())
        .context("Failed to load configuration")?;
    let options = StatusOptions {
        topology: config.session.topology().context("Invalid network settings")?,
        log_lines,
    };
    let runtime = DockerCli::new().context("Container runtime not available")?;
    let firewall = IptablesFirewall::default();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let report = rt.block_on(status::collect(
        &runtime,
        &firewall,
        &TcpChecker::default(),
        &std::env::temp_dir(),
        &options,
    ));

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
    } else {
        print!("{}", report.render_text());
    }

    let unhealthy = report
        .sessions
        .iter()
        .any(|s| s.owner_alive && !s.is_healthy());
    Ok(if unhealthy { 1 } else { 0 })
}

fn check(target: &str, args: &PolicyArgs, config_path: Option<&Path>) -> Result<i32> {
    let config = ConfigLoader::new()
        .load(config_path, args.to_config())
        .context("Failed to load configuration")?;
    let policy = config
        .policy_builder()
        .and_then(|builder| builder.build())
        .context("Invalid policy")?;

    let (verdict, host) = if target.contains("://") {
        (policy.decide_url(target), host_of(target))
    } else {
        (policy.admits_host(target), target.to_string())
    };

    println!("{}: {} ({})", target, verdict.decision, verdict.reason);
    if policy.requires_path_visibility(&host) {
        println!("TLS to {} is intercepted so request paths can be checked", host);
    }
    if !verdict.is_allowed() {
        println!("To allow it: --allow-domains {}", host);
        return Ok(1);
    }
    Ok(0)
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

fn logs(path: Option<PathBuf>, filter: &SummaryFilter, json: bool) -> Result<i32> {
    let log_path = match path {
        Some(path) if path.is_dir() => path.join(LOGS_DIR).join(ACCESS_LOG_FILE),
        Some(path) => path,
        None => latest_access_log(&std::env::temp_dir())
            .context("No kept workspace found; pass the access log path")?,
    };

    let records = read_records(&log_path)
        .with_context(|| format!("Failed to read {}", log_path.display()))?;
    let summary = AccessSummary::build(&records, filter);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
    } else {
        print!("{}", summary.render_table());
    }
    Ok(0)
}

/// Access log of the most recently modified workspace under `tmp_root`.
fn latest_access_log(tmp_root: &Path) -> Option<PathBuf> {
    std::fs::read_dir(tmp_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(RESOURCE_PREFIX) && name.ends_with("-workspace")
        })
        .map(|entry| entry.path().join(LOGS_DIR).join(ACCESS_LOG_FILE))
        .filter_map(|log| {
            let modified = log.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, log))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, log)| log)
}

/// Serve the proxy until SIGINT, SIGTERM or SIGHUP.
fn run_proxy(workspace: &Path) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::from_workspace(workspace, shutdown_rx)
            .context("Failed to load proxy configuration")?;
        let listeners = ProxyListeners::bind(server.bind_addr(), server.listen_ports())
            .await
            .context("Failed to bind proxy listeners")?;

        let interrupt = wait_for_signal();
        tokio::spawn(async move {
            let signal = interrupt.await;
            info!("Received signal {}, shutting down proxy", signal);
            let _ = shutdown_tx.send(true);
        });

        server.run(listeners).await.context("Proxy failed")?;
        Ok::<_, anyhow::Error>(0)
    })
}

/// Block until SIGINT, SIGTERM or SIGHUP.
fn pause() -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let signal = runtime.block_on(async { wait_for_signal().await });
    debug!("Received signal {}, exiting", signal);
    Ok(0)
}

/// Drop network capabilities and exec. Only returns on failure.
fn run_entrypoint(command: &[String]) -> i32 {
    match entrypoint::run(command) {
        EntrypointError::Exec { program, source } => {
            eprintln!("egress-warden: cannot run {}: {}", program, source);
            if source.kind() == std::io::ErrorKind::NotFound {
                COMMAND_NOT_FOUND_EXIT_CODE
            } else {
                EXEC_FAILED_EXIT_CODE
            }
        }
        e => {
            eprintln!(
                "egress-warden: firewall failed ({}): {}",
                FailedLayer::Redirection,
                e
            );
            FIREWALL_FAILURE_EXIT_CODE
        }
    }
}
