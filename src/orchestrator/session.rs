//! The per-run session record and its phase machine.
//!
//! ```text
//! Created ─► NetworkUp ─► ProxyHealthy ─► Running ─► Exited
//!    │           │             │             │          │
//!    └───────────┴─────────────┴──────┬──────┴──────────┘
//!                                     ▼
//!                                  TornDown
//! ```
//!
//! Nothing in here is global: the orchestrator owns the value and hands it
//! to teardown. Everything a sweep needs is also derivable from the id.

use super::error::PhaseError;
use crate::enforce::HostHook;
use crate::sandbox::naming::SessionId;
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    NetworkUp,
    ProxyHealthy,
    Running,
    Exited,
    TornDown,
}

impl Phase {
    /// The phase that normally follows this one.
    fn successor(self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::NetworkUp),
            Phase::NetworkUp => Some(Phase::ProxyHealthy),
            Phase::ProxyHealthy => Some(Phase::Running),
            Phase::Running => Some(Phase::Exited),
            Phase::Exited => Some(Phase::TornDown),
            Phase::TornDown => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::NetworkUp => "network-up",
            Phase::ProxyHealthy => "proxy-healthy",
            Phase::Running => "running",
            Phase::Exited => "exited",
            Phase::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Whether the execution environment's firewall may still change.
///
/// `Elevated` until the host has loaded the redirection rules into the
/// namespace; nothing started after that holds the capability. Mirrors the
/// entrypoint's capability typestate. There is no transition back to
/// `Elevated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityPhase {
    Elevated,
    Dropped,
}

/// Everything known about one run.
#[derive(Debug, Clone)]
pub struct RunSession {
    id: SessionId,
    workspace: PathBuf,
    network: String,
    proxy: String,
    netns: String,
    exec: String,
    hook: HostHook,
    phase: Phase,
    capability: CapabilityPhase,
    exit_code: Option<i32>,
}

impl RunSession {
    /// New session in [`Phase::Created`], all names derived from `id`.
    pub fn new(id: SessionId, workspace: PathBuf) -> Self {
        Self {
            network: id.network_name(),
            proxy: id.proxy_container(),
            netns: id.netns_container(),
            exec: id.exec_container(),
            hook: HostHook::for_session(&id),
            id,
            workspace,
            phase: Phase::Created,
            capability: CapabilityPhase::Elevated,
            exit_code: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// Container holding the execution environment's network namespace.
    pub fn netns(&self) -> &str {
        &self.netns
    }

    pub fn exec(&self) -> &str {
        &self.exec
    }

    pub fn hook(&self) -> &HostHook {
        &self.hook
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn capability(&self) -> CapabilityPhase {
        self.capability
    }

    /// Exit code of the user command, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Move to `next`. Only the immediate successor, or `TornDown`, is
    /// accepted.
    pub fn advance(&mut self, next: Phase) -> Result<(), PhaseError> {
        let allowed = next == Phase::TornDown || self.phase.successor() == Some(next);
        if !allowed {
            return Err(PhaseError {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Record the user command's exit and move to [`Phase::Exited`].
    pub fn record_exit(&mut self, code: i32) -> Result<(), PhaseError> {
        self.advance(Phase::Exited)?;
        self.exit_code = Some(code);
        Ok(())
    }

    /// The redirection rules are in place and nothing left in the session
    /// can change them.
    pub fn mark_capability_dropped(&mut self) {
        self.capability = CapabilityPhase::Dropped;
    }

    pub fn is_torn_down(&self) -> bool {
        self.phase == Phase::TornDown
    }
}
