//! Test seams: in-process implementations of the orchestrator traits.
//!
//! Nothing on the command-line path uses these. They keep containers,
//! networks and host chains in memory and can be told to fail at specific
//! steps, which is how lifecycle behaviour is tested without Docker or
//! root, both by this crate's integration tests and by code embedding the
//! [`Orchestrator`](super::Orchestrator).

use super::error::{CommandError, EnforcementApplyError, FailedLayer, FirewallError, RuntimeError};
use super::firewall::HostFirewall;
use super::health::HealthChecker;
use super::runtime::{ContainerRuntime, ContainerSpec, NetworkSpec, ResourceSummary};
use crate::enforce::{HostHook, HostRules, RedirectionRules};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// First PID handed out to running containers.
const FIRST_PID: u32 = 40_000;

/// A container known to [`InMemoryRuntime`].
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    pub started: bool,
    pub pid: u32,
    pub spec: Option<ContainerSpec>,
}

impl MemoryContainer {
    fn state(&self) -> &'static str {
        match (self.running, self.started) {
            (true, _) => "running",
            (false, true) => "exited",
            (false, false) => "created",
        }
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    networks: BTreeMap<String, BTreeMap<String, String>>,
    containers: BTreeMap<String, MemoryContainer>,
    output: BTreeMap<String, String>,
    network_conflicts: u32,
    fail_proxy: bool,
    exit_code: i32,
    attach_delay: Option<Duration>,
    next_pid: u32,
    log: Vec<String>,
}

/// [`ContainerRuntime`] that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<RuntimeState>,
}

fn label_map(labels: &[(String, String)]) -> BTreeMap<String, String> {
    labels.iter().cloned().collect()
}

fn has_label(labels: &BTreeMap<String, String>, label: &str) -> bool {
    match label.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(label),
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit code reported by [`ContainerRuntime::start_attached`].
    pub fn with_exit_code(self, code: i32) -> Self {
        self.state.lock().unwrap().exit_code = code;
        self
    }

    /// Make the next `count` network creations fail with a conflict.
    pub fn with_network_conflicts(self, count: u32) -> Self {
        self.state.lock().unwrap().network_conflicts = count;
        self
    }

    /// Make [`ContainerRuntime::start_attached`] block this long before it
    /// reports the exit code.
    pub fn with_attach_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().attach_delay = Some(delay);
        self
    }

    /// Make every detached container start fail.
    pub fn with_failing_proxy(self) -> Self {
        self.state.lock().unwrap().fail_proxy = true;
        self
    }

    /// Add a network as if a previous run had created it.
    pub fn insert_network(&self, name: &str, labels: &[(String, String)]) {
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), label_map(labels));
    }

    /// Add a container as if a previous run had created it.
    pub fn insert_container(&self, name: &str, labels: &[(String, String)]) {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            MemoryContainer {
                labels: label_map(labels),
                running: true,
                started: true,
                pid: 0,
                spec: None,
            },
        );
    }

    /// Output returned by [`ContainerRuntime::logs`] for `name`.
    pub fn set_output(&self, name: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .output
            .insert(name.to_string(), output.to_string());
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    /// Every operation performed, in order, as `"<op> <name>"`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    fn add_container(&self, spec: &ContainerSpec, running: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict {
                name: spec.name.clone(),
                message: "container name already in use".to_string(),
            });
        }
        let network_exists = match spec.network.strip_prefix("container:") {
            Some(owner) => state.containers.get(owner).is_some_and(|c| c.running),
            None => state.networks.contains_key(&spec.network),
        };
        if !network_exists {
            return Err(RuntimeError::Command(CommandError::Failed {
                cmd: format!("create {}", spec.name),
                stderr: format!("network {} not found", spec.network),
            }));
        }
        let pid = if running { state.allocate_pid() } else { 0 };
        state.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                labels: label_map(&spec.labels),
                running,
                started: running,
                pid,
                spec: Some(spec.clone()),
            },
        );
        Ok(())
    }
}

impl RuntimeState {
    fn allocate_pid(&mut self) -> u32 {
        self.next_pid += 1;
        FIRST_PID + self.next_pid
    }
}

impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("create-network {}", spec.name));
        if state.network_conflicts > 0 {
            state.network_conflicts -= 1;
            return Err(RuntimeError::Conflict {
                name: spec.name.clone(),
                message: "Pool overlaps with other one on this address space".to_string(),
            });
        }
        if state.networks.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict {
                name: spec.name.clone(),
                message: "network already exists".to_string(),
            });
        }
        state.networks.insert(spec.name.clone(), label_map(&spec.labels));
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("remove-network {name}"));
        state.networks.remove(name);
        Ok(())
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("run {}", spec.name));
            state.fail_proxy
        };
        if fail {
            return Err(RuntimeError::Command(CommandError::Failed {
                cmd: format!("run {}", spec.name),
                stderr: "image not found".to_string(),
            }));
        }
        self.add_container(spec, true)
    }

    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().log.push(format!("create {}", spec.name));
        self.add_container(spec, false)
    }

    fn start_attached(&self, name: &str) -> Result<i32, RuntimeError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("start {name}"));
            state.attach_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock().unwrap();
        let code = state.exit_code;
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                container.started = true;
                Ok(code)
            }
            None => Err(RuntimeError::Command(CommandError::Failed {
                cmd: format!("start {name}"),
                stderr: format!("No such container: {name}"),
            })),
        }
    }

    fn pid(&self, name: &str) -> Result<u32, RuntimeError> {
        let state = self.state.lock().unwrap();
        match state.containers.get(name) {
            Some(container) if container.running => Ok(container.pid),
            Some(_) => Err(RuntimeError::NotRunning(name.to_string())),
            None => Err(RuntimeError::Command(CommandError::Failed {
                cmd: format!("inspect {name}"),
                stderr: format!("No such container: {name}"),
            })),
        }
    }

    fn logs(&self, name: &str, lines: usize) -> Result<String, RuntimeError> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(name) {
            return Err(RuntimeError::Command(CommandError::Failed {
                cmd: format!("logs {name}"),
                stderr: format!("No such container: {name}"),
            }));
        }
        let output = state.output.get(name).map(String::as_str).unwrap_or_default();
        let all: Vec<&str> = output.lines().collect();
        let tail = &all[all.len().saturating_sub(lines)..];
        Ok(tail.iter().map(|line| format!("{line}\n")).collect())
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("remove {name}"));
        state.containers.remove(name);
        Ok(())
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| has_label(&c.labels, label))
            .map(|(name, c)| ResourceSummary {
                name: name.clone(),
                labels: c.labels.clone(),
                state: Some(c.state().to_string()),
            })
            .collect())
    }

    fn list_networks(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .filter(|(_, labels)| has_label(labels, label))
            .map(|(name, labels)| ResourceSummary {
                name: name.clone(),
                labels: labels.clone(),
                state: None,
            })
            .collect())
    }
}

/// [`HostFirewall`] that tracks installed chains in memory.
#[derive(Debug, Default)]
pub struct InMemoryFirewall {
    chains: Mutex<BTreeSet<String>>,
    redirected: Mutex<Vec<u32>>,
    fail_apply: bool,
    fail_redirect: bool,
}

impl InMemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply fail.
    pub fn failing() -> Self {
        Self {
            fail_apply: true,
            ..Self::default()
        }
    }

    /// Make every redirection fail.
    pub fn failing_redirect() -> Self {
        Self {
            fail_redirect: true,
            ..Self::default()
        }
    }

    /// PIDs whose network namespace received redirection rules, in order.
    pub fn redirections(&self) -> Vec<u32> {
        self.redirected.lock().unwrap().clone()
    }

    /// Add a chain as if a previous run had installed it.
    pub fn insert_chain(&self, chain: &str) {
        self.chains.lock().unwrap().insert(chain.to_string());
    }

    pub fn chains(&self) -> Vec<String> {
        self.chains.lock().unwrap().iter().cloned().collect()
    }
}

impl HostFirewall for InMemoryFirewall {
    fn apply(&self, rules: &HostRules) -> Result<(), EnforcementApplyError> {
        if self.fail_apply {
            return Err(EnforcementApplyError {
                layer: FailedLayer::HostFirewall,
                message: format!("{} chain is not available", rules.hook().hook_chain),
            });
        }
        self.chains.lock().unwrap().insert(rules.chain().to_string());
        Ok(())
    }

    fn rollback(&self, hook: &HostHook) -> Result<(), FirewallError> {
        self.chains.lock().unwrap().remove(&hook.chain);
        Ok(())
    }

    fn redirect(&self, pid: u32, _rules: &RedirectionRules) -> Result<(), EnforcementApplyError> {
        if self.fail_redirect {
            return Err(EnforcementApplyError {
                layer: FailedLayer::Redirection,
                message: format!("iptables-restore in namespace of {pid}: Permission denied"),
            });
        }
        self.redirected.lock().unwrap().push(pid);
        Ok(())
    }

    fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        Ok(self.chains())
    }
}

/// [`HealthChecker`] that fails a fixed number of times before succeeding.
#[derive(Debug, Default)]
pub struct ScriptedChecker {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedChecker {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn never_healthy() -> Self {
        Self::failing_times(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthChecker for ScriptedChecker {
    async fn check(&self, _target: SocketAddrV4) -> Result<(), String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err("connection refused".to_string())
        } else {
            Ok(())
        }
    }
}
