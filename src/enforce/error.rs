//! Errors raised while synthesizing an enforcement plan.

use crate::sandbox::error::WorkspaceError;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to derive or persist an [`EnforcementPlan`](super::EnforcementPlan).
#[derive(Debug, Error)]
pub enum PlanError {
    /// The network topology is unusable.
    #[error("Invalid network topology: {0}")]
    Topology(String),

    /// The three rule sets disagree. This is always a bug: the plan is
    /// discarded before anything is applied.
    #[error("Enforcement layers disagree: {0}")]
    Inconsistent(String),

    /// Writing a rendered artifact into the workspace failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Reading a rendered artifact failed.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Source path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Proxy rules could not be (de)serialized.
    #[error("Failed to encode proxy rules: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_display() {
        let err = PlanError::Inconsistent("port 443 is not intercepted".to_string());
        assert!(err.to_string().contains("port 443"));
    }
}
