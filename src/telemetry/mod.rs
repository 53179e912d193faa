//! Telemetry and audit logging for egress-warden.
//!
//! This module provides structured logging to syslog with the `EGRESS_WARDEN` tag.
//! Lifecycle events are logged for SIEM integration and audit trails.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): session start/end, firewall failures and
//!   sweeps go to syslog, never stdout/stderr
//! - **Access records** (JSON lines): one line per proxy decision, in the
//!   run's workspace
//! - **Debug logging** (tracing): Development logs go to stderr via `tracing`
//!
//! # Usage
//!
//! ```ignore
//! use egress_warden::telemetry::{self, AuditEvent};
//!
//! // Initialize at startup; failure only means no audit trail.
//! if let Err(e) = telemetry::init_logger() {
//!     tracing::warn!("{}", e);
//! }
//!
//! telemetry::emit(AuditEvent::FirewallFailure {
//!     session: None,
//!     layer: "host-firewall".to_string(),
//!     message: "DOCKER-USER chain is not available".to_string(),
//! });
//! ```
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"session_start","session":"0badcafe","user":"developer","program":"pip","pid":12345,"path_visibility":false}
//! ```

pub mod access;
mod error;
mod events;
mod syslog;

pub use access::{
    ACCESS_LOG_FILE, AccessLog, AccessRecord, AccessSummary, DomainStats, Listener, SummaryFilter,
    read_records,
};
pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG, emit, init_logger, try_audit};
