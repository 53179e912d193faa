//! Error types for the run lifecycle.
//!
//! A run can end in two very different ways that the exit code must keep
//! apart: the user command failed (its own code, untouched), or the
//! firewall never came up ([`FIREWALL_FAILURE_EXIT_CODE`] plus a diagnostic
//! naming the [`FailedLayer`]).

use crate::enforce::PlanError;
use crate::policy::PolicyError;
use crate::sandbox::error::{CaError, WorkspaceError};
use std::fmt;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Exit code reserved for "the firewall failed to start".
pub const FIREWALL_FAILURE_EXIT_CODE: i32 = 70;

/// The part of the enforcement stack that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedLayer {
    Policy,
    HostFirewall,
    Network,
    Proxy,
    SessionCa,
    Workspace,
    ExecutionEnvironment,
    Redirection,
}

impl FailedLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            FailedLayer::Policy => "policy",
            FailedLayer::HostFirewall => "host-firewall",
            FailedLayer::Network => "network",
            FailedLayer::Proxy => "proxy",
            FailedLayer::SessionCa => "session-ca",
            FailedLayer::Workspace => "workspace",
            FailedLayer::ExecutionEnvironment => "execution-environment",
            FailedLayer::Redirection => "redirection",
        }
    }
}

impl fmt::Display for FailedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be started.
    #[error("Failed to run {cmd}: {source}")]
    Spawn {
        /// The command line.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command exited unsuccessfully.
    #[error("{cmd} failed: {stderr}")]
    Failed {
        /// The command line.
        cmd: String,
        /// Standard error output.
        stderr: String,
    },
}

impl CommandError {
    /// Standard error of a failed command, empty if it never ran.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Spawn { .. } => "",
            CommandError::Failed { stderr, .. } => stderr,
        }
    }
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime binary is not installed.
    #[error("Container runtime '{0}' not found in PATH")]
    NotFound(String),

    /// A name or address is already taken, most likely by a session that
    /// has not been reaped yet.
    #[error("Resource conflict for {name}: {message}")]
    Conflict {
        /// The resource being created.
        name: String,
        /// The runtime's message.
        message: String,
    },

    /// Any other command failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Runtime output could not be parsed.
    #[error("Unexpected runtime output: {0}")]
    Parse(String),

    /// The container exists but has no running process.
    #[error("Container {0} is not running")]
    NotRunning(String),

    /// A mount spec is not `host:target[:ro|rw]`.
    #[error("Invalid mount spec '{0}': expected host:target[:ro|rw]")]
    InvalidMount(String),
}

/// Errors from the host firewall backend.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// A firewall command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// The proxy never became ready.
#[derive(Debug, Error)]
#[error("Proxy at {target} not ready after {attempts} attempts: {last_error}")]
pub struct HealthCheckError {
    /// Address that was checked.
    pub target: SocketAddrV4,
    /// Number of checks made.
    pub attempts: u32,
    /// Error of the last check.
    pub last_error: String,
}

/// Rule application failed partway through a layer. The layer has already
/// been rolled back when this is returned.
#[derive(Debug, Error)]
#[error("Failed to apply {layer} rules: {message}")]
pub struct EnforcementApplyError {
    /// The layer that failed.
    pub layer: FailedLayer,
    /// What went wrong.
    pub message: String,
}

/// Invalid phase transition of a run.
#[derive(Debug, Error)]
#[error("Invalid session transition from {from} to {to}")]
pub struct PhaseError {
    /// Current phase.
    pub from: String,
    /// Requested phase.
    pub to: String,
}

/// Everything that stops a run before the user command's exit code exists.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid domain or URL pattern.
    #[error("Invalid policy: {0}")]
    Policy(#[from] PolicyError),

    /// The enforcement plan could not be derived.
    #[error("Failed to build enforcement plan: {0}")]
    Plan(#[from] PlanError),

    /// Workspace creation or writes failed.
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// Session CA generation failed.
    #[error("Session CA error: {0}")]
    Ca(#[from] CaError),

    /// Rules could not be applied.
    #[error(transparent)]
    EnforcementApply(#[from] EnforcementApplyError),

    /// The isolated network could not be created.
    #[error("Failed to create isolated network: {0}")]
    Network(#[source] RuntimeError),

    /// The proxy container could not be started.
    #[error("Failed to start proxy: {0}")]
    Proxy(#[source] RuntimeError),

    /// The proxy never became healthy.
    #[error(transparent)]
    HealthCheck(#[from] HealthCheckError),

    /// The execution environment could not be created or started.
    #[error("Failed to start execution environment: {0}")]
    ExecutionEnvironment(#[source] RuntimeError),

    /// The run's state machine was driven out of order.
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl EngineError {
    /// Layer named in the diagnostic.
    pub fn layer(&self) -> FailedLayer {
        match self {
            EngineError::Plan(PlanError::Workspace(_)) | EngineError::Workspace(_) => {
                FailedLayer::Workspace
            }
            EngineError::Policy(_) | EngineError::Plan(_) => FailedLayer::Policy,
            EngineError::Ca(_) => FailedLayer::SessionCa,
            EngineError::EnforcementApply(e) => e.layer,
            EngineError::Network(_) => FailedLayer::Network,
            EngineError::Proxy(_) | EngineError::HealthCheck(_) => FailedLayer::Proxy,
            EngineError::ExecutionEnvironment(_) | EngineError::Phase(_) => {
                FailedLayer::ExecutionEnvironment
            }
        }
    }

    /// Exit code for this failure. Always the reserved firewall code.
    pub fn exit_code(&self) -> i32 {
        FIREWALL_FAILURE_EXIT_CODE
    }

    /// Whether the run may be retried once after a sweep.
    pub fn is_collision(&self) -> bool {
        matches!(
            self,
            EngineError::Network(RuntimeError::Conflict { .. })
                | EngineError::Proxy(RuntimeError::Conflict { .. })
                | EngineError::ExecutionEnvironment(RuntimeError::Conflict { .. })
                | EngineError::Workspace(WorkspaceError::Exists(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_layer_names() {
        assert_eq!(FailedLayer::HostFirewall.to_string(), "host-firewall");
        assert_eq!(FailedLayer::ExecutionEnvironment.to_string(), "execution-environment");
    }

    #[test]
    fn test_layer_attribution() {
        let err: EngineError = PolicyError::OverbroadWildcard("*.com".into()).into();
        assert_eq!(err.layer(), FailedLayer::Policy);

        let err: EngineError = EnforcementApplyError {
            layer: FailedLayer::HostFirewall,
            message: "DOCKER-USER missing".into(),
        }
        .into();
        assert_eq!(err.layer(), FailedLayer::HostFirewall);
        assert!(err.to_string().contains("host-firewall"));

        let err: EngineError = HealthCheckError {
            target: "172.30.0.10:3128".parse().unwrap(),
            attempts: 30,
            last_error: "connection refused".into(),
        }
        .into();
        assert_eq!(err.layer(), FailedLayer::Proxy);
        assert_eq!(err.exit_code(), FIREWALL_FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_collision_detection() {
        let err = EngineError::Network(RuntimeError::Conflict {
            name: "run-0badcafe-network".into(),
            message: "Pool overlaps with other one on this address space".into(),
        });
        assert!(err.is_collision());

        let err = EngineError::Workspace(WorkspaceError::Exists(PathBuf::from("/tmp/x")));
        assert!(err.is_collision());

        let err = EngineError::Network(RuntimeError::NotFound("docker".into()));
        assert!(!err.is_collision());
    }

    #[test]
    fn test_command_error_stderr() {
        let err = CommandError::Failed {
            cmd: "docker rm".into(),
            stderr: "No such container".into(),
        };
        assert_eq!(err.stderr(), "No such container");
    }
}
