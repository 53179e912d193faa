//! Telemetry error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// Failed to serialize event to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Logger already initialized.
    #[error("Audit logger already initialized")]
    AlreadyInitialized,

    /// The access log could not be opened or read.
    #[error("Access log {path}: {source}")]
    AccessLog {
        /// Path of the access log.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
