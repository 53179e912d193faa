//! Read-only view of the sessions on this host.
//!
//! Backs `egress-warden status`. Nothing here changes state: it lists what
//! [`list_sessions`] finds, adds container states, whether each owner is
//! still alive and whether its proxy answers, and names the core resources
//! a session with a live owner should have but does not.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::firewall::HostFirewall;
use super::health::HealthChecker;
use super::runtime::ContainerRuntime;
use crate::enforce::{NetworkTopology, PROXY_RULES_FILE, load_proxy_rules};
use crate::sandbox::cleanup::{SessionResources, list_sessions, process_exists};
use crate::sandbox::naming::{LABEL_SESSION, SessionId};

/// One container of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    /// Runtime state (`running`, `exited`, ...), if the runtime reported one.
    pub state: Option<String>,
    /// Last lines of output, when asked for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

/// Whether the session's proxy accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProxyStatus {
    /// No running proxy container.
    Absent,
    Healthy { target: String },
    Unreachable { target: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: String,
    pub owner_pid: Option<u32>,
    pub owner_alive: bool,
    pub containers: Vec<ContainerStatus>,
    pub networks: Vec<String>,
    /// Host-side bridge interface the session's rules match on.
    pub bridge: String,
    pub chains: Vec<String>,
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub staging: Vec<PathBuf>,
    pub proxy: ProxyStatus,
    /// Core resources a session with a live owner is missing.
    pub missing: Vec<String>,
}

impl SessionStatus {
    /// Live owner, nothing missing, proxy answering.
    pub fn is_healthy(&self) -> bool {
        self.owner_alive
            && self.missing.is_empty()
            && matches!(self.proxy, ProxyStatus::Healthy { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub sessions: Vec<SessionStatus>,
}

/// What to collect beyond the inventory.
#[derive(Debug, Clone)]
pub struct StatusOptions {
    /// Topology used when a session's workspace has no proxy rules.
    pub topology: NetworkTopology,
    /// Include this many lines of output per container.
    pub log_lines: Option<usize>,
}

/// Inspect every session under `tmp_root` and on the runtime and firewall.
pub async fn collect<R, F, H>(
    runtime: &R,
    firewall: &F,
    checker: &H,
    tmp_root: &Path,
    options: &StatusOptions,
) -> StatusReport
where
    R: ContainerRuntime + ?Sized,
    F: HostFirewall + ?Sized,
    H: HealthChecker,
{
    let inventory = list_sessions(runtime, firewall, tmp_root);
    let states: BTreeMap<String, Option<String>> = match runtime.list_containers(LABEL_SESSION) {
        Ok(containers) => containers.into_iter().map(|c| (c.name, c.state)).collect(),
        Err(e) => {
            warn!("Failed to read container states: {}", e);
            BTreeMap::new()
        }
    };

    let mut sessions = Vec::with_capacity(inventory.len());
    for (id, resources) in inventory.iter() {
        let containers = resources
            .containers
            .iter()
            .map(|name| ContainerStatus {
                name: name.clone(),
                state: states.get(name).cloned().flatten(),
                logs: options.log_lines.and_then(|lines| tail(runtime, name, lines)),
            })
            .collect::<Vec<_>>();

        let proxy_running = containers
            .iter()
            .any(|c| c.name == id.proxy_container() && c.state.as_deref() == Some("running"));
        let proxy = if proxy_running {
            check_proxy(checker, proxy_target(resources, &options.topology)).await
        } else {
            ProxyStatus::Absent
        };

        let owner_alive = resources.owner_pid.is_some_and(process_exists);
        let missing = if owner_alive {
            missing_resources(id, resources)
        } else {
            Vec::new()
        };

        sessions.push(SessionStatus {
            session: id.to_string(),
            owner_pid: resources.owner_pid,
            owner_alive,
            containers,
            networks: resources.networks.clone(),
            bridge: id.bridge_name(),
            chains: resources.chains.clone(),
            workspace: resources.workspace.clone(),
            staging: resources.staging.clone(),
            proxy,
            missing,
        });
    }
    StatusReport { sessions }
}

fn tail<R: ContainerRuntime + ?Sized>(runtime: &R, name: &str, lines: usize) -> Option<String> {
    match runtime.logs(name, lines) {
        Ok(output) => Some(output),
        Err(e) => {
            debug!("No logs for {}: {}", name, e);
            None
        }
    }
}

/// The forward listener, from the session's own rules when readable.
fn proxy_target(resources: &SessionResources, topology: &NetworkTopology) -> SocketAddrV4 {
    let port = resources
        .workspace
        .as_ref()
        .and_then(|ws| load_proxy_rules(&ws.join(PROXY_RULES_FILE)).ok())
        .map_or(topology.forward_port, |rules| rules.listen.forward);
    topology.proxy_socket(port)
}

async fn check_proxy<H: HealthChecker>(checker: &H, target: SocketAddrV4) -> ProxyStatus {
    match checker.check(target).await {
        Ok(()) => ProxyStatus::Healthy {
            target: target.to_string(),
        },
        Err(reason) => ProxyStatus::Unreachable {
            target: target.to_string(),
            reason,
        },
    }
}

/// The execution container is left out: it does not exist until the
/// proxy is healthy, and is gone once the command exits.
fn missing_resources(id: &SessionId, resources: &SessionResources) -> Vec<String> {
    let mut missing = Vec::new();
    for name in [id.proxy_container(), id.netns_container()] {
        if !resources.containers.contains(&name) {
            missing.push(name);
        }
    }
    if !resources.networks.contains(&id.network_name()) {
        missing.push(id.network_name());
    }
    if !resources.chains.contains(&id.chain_name()) {
        missing.push(id.chain_name());
    }
    if resources.workspace.is_none() {
        missing.push(id.workspace_dir_name());
    }
    missing
}

impl StatusReport {
    pub fn render_text(&self) -> String {
        if self.sessions.is_empty() {
            return "No sessions\n".to_string();
        }

        let mut out = String::new();
        for s in &self.sessions {
            let owner = match (s.owner_pid, s.owner_alive) {
                (Some(pid), true) => format!("owner {pid} (running)"),
                (Some(pid), false) => format!("owner {pid} (gone)"),
                (None, _) => "owner unknown".to_string(),
            };
            out.push_str(&format!("session {}  {}\n", s.session, owner));

            for c in &s.containers {
                let state = c.state.as_deref().unwrap_or("unknown");
                out.push_str(&format!("  container  {:<28} {}\n", c.name, state));
                if let Some(logs) = &c.logs {
                    for line in logs.lines() {
                        out.push_str(&format!("    | {line}\n"));
                    }
                }
            }
            for n in &s.networks {
                out.push_str(&format!("  network    {:<28} bridge {}\n", n, s.bridge));
            }
            for c in &s.chains {
                out.push_str(&format!("  chain      {c}\n"));
            }
            if let Some(ws) = &s.workspace {
                out.push_str(&format!("  workspace  {}\n", ws.display()));
            }
            for st in &s.staging {
                out.push_str(&format!("  staging    {}\n", st.display()));
            }
            match &s.proxy {
                ProxyStatus::Absent => {}
                ProxyStatus::Healthy { target } => {
                    out.push_str(&format!("  proxy      healthy at {target}\n"));
                }
                ProxyStatus::Unreachable { target, reason } => {
                    out.push_str(&format!("  proxy      unreachable at {target}: {reason}\n"));
                }
            }
            if !s.missing.is_empty() {
                out.push_str(&format!("  missing    {}\n", s.missing.join(", ")));
            }
        }
        out
    }
}
