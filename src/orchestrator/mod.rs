//! Session orchestration.
//!
//! Brings one run up layer by layer, runs the user command, and tears the
//! run down again:
//!
//! ```text
//!  sweep ─► plan ─► workspace/CA ─► host rules ─► network ─► proxy ─► health
//!                                                                       │
//!        execution environment ◄── redirection ◄── namespace holder ◄───┘
//!                 │
//!                 └─► start attached ─► exit/signal ─► teardown
//! ```
//!
//! The host rules go in before the network exists, so there is no moment in
//! which a container on the session bridge is unfiltered. The execution
//! environment is two containers sharing one network namespace: a holder
//! that owns the session address, and the user's container that joins it.
//! The host loads the redirection rules into that namespace between the
//! two, so the user's image needs no firewall tooling and never holds
//! `CAP_NET_ADMIN`.
//!
//! Every failure before the command starts is an [`EngineError`] naming
//! the layer, and leaves nothing behind. SIGINT, SIGTERM and SIGHUP are
//! handled from the first step on: an interrupt during bring-up tears down
//! whatever exists so far.
//!
//! The container runtime, host firewall and health checker are traits, so the
//! whole flow runs against the in-memory backends in [`memory`].

pub mod error;
pub mod firewall;
pub mod health;
pub mod memory;
pub mod runtime;
pub mod session;
pub mod status;

pub use error::{
    CommandError, EngineError, EnforcementApplyError, FIREWALL_FAILURE_EXIT_CODE, FailedLayer,
    FirewallError, HealthCheckError, RuntimeError,
};
pub use firewall::{HostFirewall, IptablesFirewall};
pub use health::{HealthChecker, TcpChecker, wait_healthy};
pub use runtime::{
    ContainerRuntime, ContainerSpec, DockerCli, MountMode, MountSpec, NetworkSpec, join_network_of,
};
pub use session::{CapabilityPhase, Phase, RunSession};
pub use status::{StatusOptions, StatusReport};

use crate::enforce::{EnforcementPlan, NetworkTopology};
use crate::policy::Policy;
use crate::sandbox::ca::BUNDLE_FILE;
use crate::sandbox::cleanup::{KeepPolicy, SweepReport, SweepScope, TeardownReport, sweep, teardown};
use crate::sandbox::naming::SessionId;
use crate::sandbox::workspace::{CA_DIR, Workspace};
use crate::sandbox::SessionCa;
use crate::telemetry::{self, AuditEvent};
use error::PhaseError;
use runtime::session_labels;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where the wrapper binary is mounted in both containers.
pub const CONTAINER_BINARY: &str = "/usr/local/bin/egress-warden";

/// Where run artifacts are mounted in both containers.
pub const CONTAINER_RUN_DIR: &str = "/run/egress-warden";

/// Where the proxy finds the host's CA bundle for upstream verification.
pub const PROXY_UPSTREAM_CA: &str = "/etc/egress-warden/upstream-ca.crt";

/// Default image for every container of a run. The proxy and the
/// namespace holder only run the mounted binary; the execution container
/// needs nothing beyond what the user command needs.
pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

/// Capabilities the execution container is created without.
const EXEC_DROPPED_CAPS: &[&str] = &["NET_ADMIN", "NET_RAW"];

/// Trust-store variables pointed at the combined bundle.
const CA_BUNDLE_VARS: &[&str] = &[
    "SSL_CERT_FILE",
    "REQUESTS_CA_BUNDLE",
    "CURL_CA_BUNDLE",
    "NODE_EXTRA_CA_CERTS",
    "PIP_CERT",
];

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub policy: Policy,
    pub topology: NetworkTopology,
    /// Program and arguments, exec'd without a shell.
    pub command: Vec<String>,
    /// Bind mounts for the execution environment, passed verbatim.
    pub mounts: Vec<MountSpec>,
    /// Environment for the execution environment.
    pub env: Vec<(String, String)>,
    /// Image for the proxy and the namespace holder.
    pub proxy_image: String,
    pub exec_image: String,
    pub health_retries: u32,
    pub health_interval: Duration,
    pub keep: KeepPolicy,
    /// Directory holding workspaces, normally `$TMPDIR`.
    pub tmp_root: PathBuf,
    /// This binary, mounted into both containers.
    pub binary: PathBuf,
    /// Host CA bundle for the proxy's upstream TLS and the combined bundle.
    pub host_ca_bundle: Option<PathBuf>,
    pub interactive: bool,
    pub tty: bool,
}

impl RunRequest {
    /// A request with default topology, images and timeouts.
    pub fn new(policy: Policy, command: Vec<String>) -> Self {
        Self {
            policy,
            topology: NetworkTopology::default(),
            command,
            mounts: Vec::new(),
            env: Vec::new(),
            proxy_image: DEFAULT_IMAGE.to_string(),
            exec_image: DEFAULT_IMAGE.to_string(),
            health_retries: health::DEFAULT_RETRIES,
            health_interval: health::DEFAULT_INTERVAL,
            keep: KeepPolicy::default(),
            tmp_root: std::env::temp_dir(),
            binary: PathBuf::from(CONTAINER_BINARY),
            host_ca_bundle: None,
            interactive: false,
            tty: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: SessionId,
    /// The user command's exit code, or `128 + signal` when interrupted.
    pub exit_code: i32,
    /// Signal that interrupted the run, if any.
    pub signal: Option<i32>,
    pub teardown: TeardownReport,
}

/// Tears a session down when dropped, unless [`finish`](Self::finish) ran.
///
/// This covers early returns and panics between bring-up and teardown.
struct SessionGuard<R: ContainerRuntime, F: HostFirewall> {
    runtime: Arc<R>,
    firewall: Arc<F>,
    session: RunSession,
    keep: KeepPolicy,
    done: bool,
}

impl<R: ContainerRuntime, F: HostFirewall> SessionGuard<R, F> {
    fn session_mut(&mut self) -> &mut RunSession {
        &mut self.session
    }

    fn finish(mut self) -> TeardownReport {
        self.done = true;
        teardown(&mut self.session, &*self.runtime, &*self.firewall, self.keep)
    }
}

impl<R: ContainerRuntime, F: HostFirewall> Drop for SessionGuard<R, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("Tearing down session {} after failure", self.session.id());
        // Failed runs never keep containers, only the workspace for
        // inspection when asked.
        let keep = KeepPolicy {
            workspace: self.keep.workspace,
            containers: false,
        };
        teardown(&mut self.session, &*self.runtime, &*self.firewall, keep);
    }
}

/// Drives [`RunSession`]s over a runtime, a firewall and a health checker.
pub struct Orchestrator<R, F, H> {
    runtime: Arc<R>,
    firewall: Arc<F>,
    checker: H,
}

impl<R, F, H> Orchestrator<R, F, H>
where
    R: ContainerRuntime + 'static,
    F: HostFirewall + 'static,
    H: HealthChecker,
{
    pub fn new(runtime: R, firewall: F, checker: H) -> Self {
        Self {
            runtime: Arc::new(runtime),
            firewall: Arc::new(firewall),
            checker,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    /// Run `request`, tearing down on SIGINT, SIGTERM or SIGHUP.
    ///
    /// The handlers are installed before anything is created.
    pub async fn run(&self, request: &RunRequest) -> Result<SessionOutcome, EngineError> {
        let interrupt = wait_for_signal();
        self.run_until(request, interrupt).await
    }

    /// Run `request`; `interrupt` resolving to a signal number aborts the
    /// run at any point and tears down what exists.
    pub async fn run_until<S>(
        &self,
        request: &RunRequest,
        interrupt: S,
    ) -> Result<SessionOutcome, EngineError>
    where
        S: Future<Output = i32>,
    {
        let started = Instant::now();
        tokio::pin!(interrupt);

        // Owned here rather than by the bring-up future, so an interrupt
        // that drops that future still finds the partial session.
        let mut slot: Option<SessionGuard<R, F>> = None;
        let first = SessionId::generate();

        let brought_up = tokio::select! {
            biased;
            signal = &mut interrupt => Err(signal),
            result = self.bring_up_with_retry(request, first.clone(), &mut slot) => Ok(result),
        };

        let outcome = match brought_up {
            Err(signal) => {
                warn!("Received signal {} during bring-up, tearing down", signal);
                let (session, teardown) = match slot.take() {
                    Some(guard) => (guard.session.id().clone(), guard.finish()),
                    None => (first, TeardownReport::default()),
                };
                SessionOutcome {
                    session,
                    exit_code: 128 + signal,
                    signal: Some(signal),
                    teardown,
                }
            }
            Ok(Err(e)) => {
                // Tear down before the failure is reported.
                drop(slot.take());
                error!("Firewall failed to start ({}): {}", e.layer(), e);
                telemetry::emit(AuditEvent::FirewallFailure {
                    session: None,
                    layer: e.layer().to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
            Ok(Ok(())) => {
                let Some(guard) = slot.take() else {
                    return Err(PhaseError {
                        from: Phase::Created.to_string(),
                        to: Phase::Running.to_string(),
                    }
                    .into());
                };
                self.attach(guard, interrupt.as_mut()).await?
            }
        };

        telemetry::emit(AuditEvent::SessionEnd {
            session: outcome.session.to_string(),
            exit_code: outcome.exit_code,
            duration_sec: started.elapsed().as_secs(),
            teardown_failures: outcome.teardown.failures.len(),
        });
        Ok(outcome)
    }

    /// Remove sessions in `scope` and audit the result.
    pub fn sweep(&self, tmp_root: &Path, scope: SweepScope) -> SweepReport {
        let report = sweep(&*self.runtime, &*self.firewall, tmp_root, scope);
        if !report.sessions.is_empty() {
            info!("Swept {} session(s)", report.sessions.len());
            telemetry::emit(AuditEvent::Sweep {
                scope: match scope {
                    SweepScope::Abandoned => "abandoned",
                    SweepScope::All => "all",
                }
                .to_string(),
                sessions: report.sessions.iter().map(ToString::to_string).collect(),
                removed: report.teardown.removed.len(),
                failures: report.teardown.failures.len(),
            });
        }
        report
    }

    /// Sweep abandoned sessions, then [`bring_up`](Self::bring_up). A
    /// collision with an unreaped session sweeps again and retries once
    /// with a fresh id.
    async fn bring_up_with_retry(
        &self,
        request: &RunRequest,
        id: SessionId,
        slot: &mut Option<SessionGuard<R, F>>,
    ) -> Result<(), EngineError> {
        self.sweep(&request.tmp_root, SweepScope::Abandoned);
        match self.bring_up(request, id, slot).await {
            Err(e) if e.is_collision() => {
                warn!("Collided with an unreaped session ({}), sweeping and retrying", e);
                drop(slot.take());
                self.sweep(&request.tmp_root, SweepScope::Abandoned);
                self.bring_up(request, SessionId::generate(), slot).await
            }
            other => other,
        }
    }

    /// Everything up to a created, not yet started, execution environment.
    ///
    /// The session guard goes into `slot` as soon as there is something to
    /// tear down, and stays there on error.
    async fn bring_up(
        &self,
        request: &RunRequest,
        id: SessionId,
        slot: &mut Option<SessionGuard<R, F>>,
    ) -> Result<(), EngineError> {
        let topology = &request.topology;
        let plan = EnforcementPlan::synthesize(&request.policy, topology.clone(), &id)?;

        let mut workspace = Workspace::create_in(&request.tmp_root, &id)?;
        // From here on the guard owns removal.
        workspace.hand_over();
        let guard = slot.insert(SessionGuard {
            runtime: Arc::clone(&self.runtime),
            firewall: Arc::clone(&self.firewall),
            session: RunSession::new(id.clone(), workspace.path().to_path_buf()),
            keep: request.keep,
            done: false,
        });

        telemetry::emit(AuditEvent::SessionStart {
            session: id.to_string(),
            user: current_user(),
            program: request.command.first().cloned().unwrap_or_default(),
            pid: std::process::id(),
            path_visibility: plan.path_visibility(),
        });

        plan.write_to(&workspace)?;
        let bundle = if plan.path_visibility() {
            let ca = SessionCa::generate(&workspace.ca_dir())?;
            Some(ca.create_combined_bundle(request.host_ca_bundle.as_deref())?)
        } else {
            None
        };

        self.firewall.apply(plan.host_rules())?;

        let labels = session_labels(&id, std::process::id());
        let network = NetworkSpec {
            name: id.network_name(),
            bridge: id.bridge_name(),
            subnet: topology.subnet,
            gateway: topology.gateway(),
            labels: labels.clone(),
        };
        self.runtime
            .create_network(&network)
            .map_err(EngineError::Network)?;
        guard.session_mut().advance(Phase::NetworkUp)?;
        info!("Created network {} ({})", network.name, topology.subnet);

        let proxy = self.proxy_spec(request, &id, workspace.path(), &labels);
        self.runtime.run_detached(&proxy).map_err(EngineError::Proxy)?;

        let target = topology.proxy_socket(topology.forward_port);
        wait_healthy(
            &self.checker,
            target,
            request.health_retries,
            request.health_interval,
        )
        .await?;
        guard.session_mut().advance(Phase::ProxyHealthy)?;
        info!("Proxy ready at {}", target);

        let holder = self.holder_spec(request, &id, &labels);
        self.runtime
            .run_detached(&holder)
            .map_err(EngineError::ExecutionEnvironment)?;
        let pid = self
            .runtime
            .pid(&holder.name)
            .map_err(EngineError::ExecutionEnvironment)?;
        self.firewall.redirect(pid, plan.redirection())?;
        guard.session_mut().mark_capability_dropped();
        debug!("Redirection in place in {} (PID {})", holder.name, pid);

        let exec = self.exec_spec(request, &id, bundle.as_deref(), &labels);
        self.runtime
            .create(&exec)
            .map_err(EngineError::ExecutionEnvironment)?;
        debug!("Created execution environment {}", exec.name);

        Ok(())
    }

    /// Start the execution environment and wait for exit or interrupt.
    async fn attach<S>(
        &self,
        mut guard: SessionGuard<R, F>,
        interrupt: Pin<&mut S>,
    ) -> Result<SessionOutcome, EngineError>
    where
        S: Future<Output = i32>,
    {
        guard.session_mut().advance(Phase::Running)?;

        let runtime = Arc::clone(&self.runtime);
        let exec = guard.session_mut().exec().to_string();
        let wait = tokio::task::spawn_blocking(move || runtime.start_attached(&exec));

        let (exit_code, signal) = tokio::select! {
            joined = wait => {
                let code = joined
                    .map_err(|e| EngineError::ExecutionEnvironment(RuntimeError::Command(
                        CommandError::Spawn {
                            cmd: "start".to_string(),
                            source: std::io::Error::other(e),
                        },
                    )))?
                    .map_err(EngineError::ExecutionEnvironment)?;
                (code, None)
            }
            signal = interrupt => {
                warn!("Received signal {}, tearing down", signal);
                (128 + signal, Some(signal))
            }
        };

        let session = guard.session_mut();
        session.record_exit(exit_code)?;
        let id = session.id().clone();
        info!("Session {} exited with code {}", id, exit_code);

        let teardown = guard.finish();
        Ok(SessionOutcome {
            session: id,
            exit_code,
            signal,
            teardown,
        })
    }

    fn proxy_spec(
        &self,
        request: &RunRequest,
        id: &SessionId,
        workspace: &Path,
        labels: &[(String, String)],
    ) -> ContainerSpec {
        let topology = &request.topology;
        let mut mounts = vec![
            MountSpec::read_only(&request.binary, CONTAINER_BINARY),
            MountSpec::read_write(workspace, CONTAINER_RUN_DIR),
        ];
        let mut env = Vec::new();
        if let Some(bundle) = &request.host_ca_bundle {
            mounts.push(MountSpec::read_only(bundle, PROXY_UPSTREAM_CA));
            env.push(("SSL_CERT_FILE".to_string(), PROXY_UPSTREAM_CA.to_string()));
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            env.push(("RUST_LOG".to_string(), filter));
        }

        ContainerSpec {
            name: id.proxy_container(),
            image: request.proxy_image.clone(),
            network: id.network_name(),
            ip: Some(topology.proxy_ip),
            labels: labels.to_vec(),
            dns: topology.dns_servers.clone(),
            mounts,
            env,
            entrypoint: Some(CONTAINER_BINARY.to_string()),
            command: vec![
                "internal-proxy".to_string(),
                "--workspace".to_string(),
                CONTAINER_RUN_DIR.to_string(),
            ],
            ..Default::default()
        }
    }

    /// The container owning the execution environment's address and
    /// network namespace. It only waits to be removed.
    fn holder_spec(
        &self,
        request: &RunRequest,
        id: &SessionId,
        labels: &[(String, String)],
    ) -> ContainerSpec {
        let topology = &request.topology;
        ContainerSpec {
            name: id.netns_container(),
            image: request.proxy_image.clone(),
            network: id.network_name(),
            ip: Some(topology.exec_ip),
            labels: labels.to_vec(),
            dns: topology.dns_servers.clone(),
            mounts: vec![MountSpec::read_only(&request.binary, CONTAINER_BINARY)],
            cap_drop: vec!["ALL".to_string()],
            entrypoint: Some(CONTAINER_BINARY.to_string()),
            command: vec!["internal-pause".to_string()],
            ..Default::default()
        }
    }

    fn exec_spec(
        &self,
        request: &RunRequest,
        id: &SessionId,
        bundle: Option<&Path>,
        labels: &[(String, String)],
    ) -> ContainerSpec {
        let topology = &request.topology;

        // Only the public bundle goes in: the workspace also holds the CA key.
        let mut mounts = vec![MountSpec::read_only(&request.binary, CONTAINER_BINARY)];
        mounts.extend(request.mounts.iter().cloned());

        let mut env = request.env.clone();
        let proxy_url = topology.forward_proxy_url();
        for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            env.push((var.to_string(), proxy_url.clone()));
        }
        env.push(("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()));
        env.push(("no_proxy".to_string(), "localhost,127.0.0.1".to_string()));

        if let Some(bundle) = bundle {
            let in_container = format!("{CONTAINER_RUN_DIR}/{CA_DIR}/{BUNDLE_FILE}");
            mounts.push(MountSpec::read_only(bundle, &in_container));
            for var in CA_BUNDLE_VARS {
                env.push((var.to_string(), in_container.clone()));
            }
        }

        let mut command = vec!["internal-entrypoint".to_string(), "--".to_string()];
        command.extend(request.command.iter().cloned());

        // Address and resolvers come with the holder's namespace.
        ContainerSpec {
            name: id.exec_container(),
            image: request.exec_image.clone(),
            network: join_network_of(&id.netns_container()),
            ip: None,
            labels: labels.to_vec(),
            dns: Vec::new(),
            mounts,
            env,
            cap_add: Vec::new(),
            cap_drop: EXEC_DROPPED_CAPS.iter().map(|c| c.to_string()).collect(),
            entrypoint: Some(CONTAINER_BINARY.to_string()),
            command,
            interactive: request.interactive,
            tty: request.tty,
        }
    }
}

/// Install SIGINT, SIGTERM and SIGHUP handlers now, and return a future
/// resolving to the number of the first of them to arrive.
///
/// Signals that arrive before the future is first polled are not lost.
/// The future never resolves if the handlers cannot be installed. Must be
/// called from inside a Tokio runtime.
pub fn wait_for_signal() -> Pin<Box<dyn Future<Output = i32> + Send>> {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut int), Ok(mut term), Ok(mut hup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        warn!("Failed to install signal handlers");
        return Box::pin(std::future::pending());
    };

    Box::pin(async move {
        tokio::select! {
            _ = int.recv() => libc::SIGINT,
            _ = term.recv() => libc::SIGTERM,
            _ = hup.recv() => libc::SIGHUP,
        }
    })
}

fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
