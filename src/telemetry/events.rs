//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `EGRESS_WARDEN` tag
//! for SIEM integration and security audit trails.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
///
/// One variant per lifecycle milestone a security reviewer wants to see.
/// Per-connection decisions are not audit events; they go to the access log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Session started: enforcement is about to be brought up.
    SessionStart {
        /// Session id.
        session: String,
        /// Username of the person running the command.
        user: String,
        /// Program being run (first word of the command).
        program: String,
        /// Process ID of the wrapper.
        pid: u32,
        /// Whether TLS interception is enabled for URL patterns.
        path_visibility: bool,
    },

    /// Session ended and was torn down.
    SessionEnd {
        /// Session id.
        session: String,
        /// Exit code returned to the caller.
        exit_code: i32,
        /// Duration of the session in seconds.
        duration_sec: u64,
        /// Resources that could not be removed.
        teardown_failures: usize,
    },

    /// The firewall could not be brought up; the command never ran.
    FirewallFailure {
        /// Session id, if one had been allocated.
        session: Option<String>,
        /// Failing layer, e.g. `host-firewall`.
        layer: String,
        /// Error message.
        message: String,
    },

    /// Abandoned or all sessions were swept.
    Sweep {
        /// `abandoned` or `all`.
        scope: String,
        /// Sessions removed.
        sessions: Vec<String>,
        /// Resources removed.
        removed: usize,
        /// Removals that failed.
        failures: usize,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
