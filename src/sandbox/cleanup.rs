//! Teardown and garbage collection of run resources.
//!
//! A run owns six kinds of resource: the execution container, the
//! namespace holder, the proxy container, the isolated network, the host
//! rule chain, and the workspace directory. They are removed in that order
//! by every path out of a run:
//!
//! - [`teardown`] after the user command exits, on signals and on error
//!   paths (also from `SessionGuard::drop`);
//! - [`sweep`] with [`SweepScope::Abandoned`] before a new run starts,
//!   which reaps runs whose owner process is gone (SIGKILL, power loss);
//! - [`sweep`] with [`SweepScope::All`] from `egress-warden cleanup --all`.
//!
//! Sweeps work from names and labels alone, never from in-memory state, so
//! they find resources of a process that no longer exists. Every removal is
//! idempotent, and failures are logged and collected rather than returned.
//!
//! # Example
//!
//! ```ignore
//! let report = sweep(&runtime, &firewall, &std::env::temp_dir(), SweepScope::Abandoned);
//! if !report.sessions.is_empty() {
//!     info!("Reaped {} abandoned sessions", report.sessions.len());
//! }
//! ```

use super::naming::{LABEL_SESSION, ResourceRole, SessionId};
use super::workspace::{owner_pid, parse_staging_name, remove_dir};
use crate::enforce::HostHook;
use crate::orchestrator::firewall::HostFirewall;
use crate::orchestrator::runtime::ContainerRuntime;
use crate::orchestrator::session::{Phase, RunSession};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to leave in place after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepPolicy {
    /// Keep the workspace directory.
    pub workspace: bool,
    /// Keep everything: containers, network, host rules and workspace.
    pub containers: bool,
}

/// Which sessions a sweep removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepScope {
    /// Only sessions whose owner process is gone.
    Abandoned,
    /// Every session, including live ones.
    All,
}

/// A removal that failed.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    pub resource: String,
    pub error: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// Outcome of a teardown or sweep.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Resources removed (or already absent).
    pub removed: Vec<String>,
    /// Resources left behind on purpose.
    pub kept: Vec<String>,
    /// Removals that failed.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<E: fmt::Display>(&mut self, resource: String, result: Result<(), E>) {
        match result {
            Ok(()) => {
                debug!("Removed {}", resource);
                self.removed.push(resource);
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", resource, e);
                self.failures.push(TeardownFailure {
                    resource,
                    error: e.to_string(),
                });
            }
        }
    }

    fn merge(&mut self, other: TeardownReport) {
        self.removed.extend(other.removed);
        self.kept.extend(other.kept);
        self.failures.extend(other.failures);
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Sessions that were reaped.
    pub sessions: Vec<SessionId>,
    pub teardown: TeardownReport,
}

/// Resources found for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionResources {
    pub containers: Vec<String>,
    pub networks: Vec<String>,
    pub chains: Vec<String>,
    pub workspace: Option<PathBuf>,
    /// Workspaces that were never renamed into place.
    pub staging: Vec<PathBuf>,
    /// Owner PID from labels, the workspace marker or a staging name.
    pub owner_pid: Option<u32>,
}

impl SessionResources {
    /// A session is abandoned when its owner is gone or unknown.
    pub fn is_abandoned(&self) -> bool {
        match self.owner_pid {
            Some(pid) => !process_exists(pid),
            None => true,
        }
    }

    pub fn count(&self) -> usize {
        self.containers.len()
            + self.networks.len()
            + self.chains.len()
            + usize::from(self.workspace.is_some())
            + self.staging.len()
    }
}

/// All sessions visible on this host.
#[derive(Debug, Clone, Default)]
pub struct SessionInventory {
    sessions: BTreeMap<SessionId, SessionResources>,
}

impl SessionInventory {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionResources> {
        self.sessions.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionResources)> {
        self.sessions.iter()
    }

    /// Sessions a sweep with `scope` would remove.
    pub fn in_scope(&self, scope: SweepScope) -> impl Iterator<Item = (&SessionId, &SessionResources)> {
        self.sessions
            .iter()
            .filter(move |(_, r)| scope == SweepScope::All || r.is_abandoned())
    }

    fn entry(&mut self, id: SessionId) -> &mut SessionResources {
        self.sessions.entry(id).or_default()
    }
}

/// Find every session's resources by label, chain name and workspace name.
///
/// Listing failures are logged and the affected kind is skipped.
pub fn list_sessions<R, F>(runtime: &R, firewall: &F, tmp_root: &Path) -> SessionInventory
where
    R: ContainerRuntime + ?Sized,
    F: HostFirewall + ?Sized,
{
    let mut inventory = SessionInventory::default();

    match runtime.list_containers(LABEL_SESSION) {
        Ok(containers) => {
            for c in containers {
                if let Some(id) = c.session() {
                    let entry = inventory.entry(id);
                    entry.owner_pid = entry.owner_pid.or(c.owner_pid());
                    entry.containers.push(c.name);
                }
            }
        }
        Err(e) => warn!("Cannot list {} containers: {}", runtime.name(), e),
    }

    match runtime.list_networks(LABEL_SESSION) {
        Ok(networks) => {
            for n in networks {
                if let Some(id) = n.session() {
                    let entry = inventory.entry(id);
                    entry.owner_pid = entry.owner_pid.or(n.owner_pid());
                    entry.networks.push(n.name);
                }
            }
        }
        Err(e) => warn!("Cannot list {} networks: {}", runtime.name(), e),
    }

    match firewall.list_chains() {
        Ok(chains) => {
            for chain in chains {
                if let Some(id) = SessionId::from_chain_name(&chain) {
                    inventory.entry(id).chains.push(chain);
                }
            }
        }
        Err(e) => warn!("Cannot list host chains: {}", e),
    }

    match fs::read_dir(tmp_root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let path = entry.path();
                if let Some((id, pid)) = parse_staging_name(&name) {
                    let resources = inventory.entry(id);
                    resources.owner_pid = resources.owner_pid.or(Some(pid));
                    resources.staging.push(path);
                    continue;
                }
                let Some((id, ResourceRole::Workspace)) = SessionId::from_resource_name(&name)
                else {
                    continue;
                };
                let pid = owner_pid(&path);
                let resources = inventory.entry(id);
                resources.owner_pid = resources.owner_pid.or(pid);
                resources.workspace = Some(path);
            }
        }
        Err(e) => debug!("Cannot read {:?}: {}", tmp_root, e),
    }

    inventory
}

/// Remove every session in `scope`.
pub fn sweep<R, F>(runtime: &R, firewall: &F, tmp_root: &Path, scope: SweepScope) -> SweepReport
where
    R: ContainerRuntime + ?Sized,
    F: HostFirewall + ?Sized,
{
    let inventory = list_sessions(runtime, firewall, tmp_root);
    let mut report = SweepReport::default();

    for (id, resources) in inventory.in_scope(scope) {
        info!(
            "Removing session {} ({} resources, owner {:?})",
            id,
            resources.count(),
            resources.owner_pid
        );
        report
            .teardown
            .merge(remove_session(runtime, firewall, id, resources));
        report.sessions.push(id.clone());
    }

    if report.sessions.is_empty() {
        debug!("No sessions to sweep");
    }
    report
}

/// Remove one swept session's resources, containers first.
fn remove_session<R, F>(
    runtime: &R,
    firewall: &F,
    id: &SessionId,
    resources: &SessionResources,
) -> TeardownReport
where
    R: ContainerRuntime + ?Sized,
    F: HostFirewall + ?Sized,
{
    let mut report = TeardownReport::default();

    // Execution environment before the proxy, so nothing is left running
    // without its filter.
    let mut containers = resources.containers.clone();
    containers.sort_by_key(|name| match SessionId::from_resource_name(name) {
        Some((_, ResourceRole::Exec)) => 0,
        Some((_, ResourceRole::Netns)) => 1,
        Some((_, ResourceRole::Proxy)) => 2,
        _ => 3,
    });
    for name in containers {
        report.record(format!("container {name}"), runtime.remove_container(&name));
    }
    for name in &resources.networks {
        report.record(format!("network {name}"), runtime.remove_network(name));
    }
    if !resources.chains.is_empty() {
        let hook = HostHook::for_session(id);
        report.record(format!("chain {}", hook.chain), firewall.rollback(&hook));
    }
    for path in resources.workspace.iter().chain(&resources.staging) {
        report.record(format!("workspace {}", path.display()), remove_dir(path));
    }
    report
}

/// Tear a run down and move it to [`Phase::TornDown`].
///
/// Calling it again on a torn-down session does nothing.
pub fn teardown<R, F>(
    session: &mut RunSession,
    runtime: &R,
    firewall: &F,
    keep: KeepPolicy,
) -> TeardownReport
where
    R: ContainerRuntime + ?Sized,
    F: HostFirewall + ?Sized,
{
    let mut report = TeardownReport::default();
    if session.is_torn_down() {
        debug!("Session {} already torn down", session.id());
        return report;
    }

    if keep.containers {
        info!(
            "Keeping all resources of session {} (workspace {:?})",
            session.id(),
            session.workspace()
        );
        report.kept.extend([
            format!("container {}", session.exec()),
            format!("container {}", session.netns()),
            format!("container {}", session.proxy()),
            format!("network {}", session.network()),
            format!("chain {}", session.hook().chain),
            format!("workspace {}", session.workspace().display()),
        ]);
    } else {
        report.record(
            format!("container {}", session.exec()),
            runtime.remove_container(session.exec()),
        );
        report.record(
            format!("container {}", session.netns()),
            runtime.remove_container(session.netns()),
        );
        report.record(
            format!("container {}", session.proxy()),
            runtime.remove_container(session.proxy()),
        );
        report.record(
            format!("network {}", session.network()),
            runtime.remove_network(session.network()),
        );
        report.record(
            format!("chain {}", session.hook().chain),
            firewall.rollback(session.hook()),
        );

        let workspace = format!("workspace {}", session.workspace().display());
        if keep.workspace {
            info!("Keeping workspace {:?}", session.workspace());
            report.kept.push(workspace);
        } else {
            report.record(workspace, remove_dir(session.workspace()));
        }
    }

    // TornDown is reachable from every phase.
    let _ = session.advance(Phase::TornDown);
    report
}

/// Check if a process with the given PID exists.
pub fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
