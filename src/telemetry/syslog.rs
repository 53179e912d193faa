//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `EGRESS_WARDEN` tag
//! for SIEM integration and security audit trails.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "EGRESS_WARDEN";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes structured JSON events to syslog.
///
/// Uses interior mutability (Mutex) to allow logging from shared references,
/// which is necessary since the logger is stored in a global OnceLock.
pub struct AuditLogger {
    /// Syslog writer protected by a mutex for interior mutability.
    /// None indicates a null logger (for testing).
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Create a new audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to connect to syslog: {}", e))
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    ///
    /// Useful for testing when syslog is not available.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event to syslog.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            // Null logger - discard silently
            return;
        };

        let timestamped = event.with_timestamp();

        match serde_json::to_string(&timestamped) {
            Ok(json) => {
                match writer.lock() {
                    Ok(mut writer) => {
                        if let Err(e) = writer.info(&json) {
                            error!("Failed to write to syslog: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to acquire syslog writer lock: {}", e);
                    }
                }
                debug!("Logged audit event: {}", json);
            }
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
            }
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger.
///
/// This must be called once at startup before any audit logging.
/// Returns an error if syslog connection fails or if already initialized.
pub fn init_logger() -> Result<(), TelemetryError> {
    let logger = AuditLogger::new()?;

    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(())
}

/// Try to get a reference to the global audit logger.
///
/// Returns None if `init_logger()` was not called.
pub fn try_audit() -> Option<&'static AuditLogger> {
    AUDIT_LOGGER.get()
}

/// Log to the global audit logger if there is one.
///
/// Audit logging is best effort: a host without syslog still runs
/// commands, it just has no audit trail.
pub fn emit(event: AuditEvent) {
    match try_audit() {
        Some(logger) => logger.log(event),
        None => debug!("Audit logger not initialized, dropping {:?}", event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "EGRESS_WARDEN");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::FirewallFailure {
            session: None,
            layer: "policy".to_string(),
            message: "test".to_string(),
        });
    }

    #[test]
    fn test_emit_without_logger() {
        // Never initialized in unit tests; must not panic.
        emit(AuditEvent::Sweep {
            scope: "abandoned".to_string(),
            sessions: Vec::new(),
            removed: 0,
            failures: 0,
        });
    }

    // Integration test - requires syslog daemon
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }

    // Integration test - requires syslog daemon
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_log_event() {
        let logger = AuditLogger::new().unwrap();

        let event = AuditEvent::SessionStart {
            session: "0badcafe".to_string(),
            user: "test_user".to_string(),
            program: "true".to_string(),
            pid: 12345,
            path_visibility: false,
        };

        // Should not panic
        logger.log(event);
    }
}
