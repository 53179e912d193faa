//! Error types for proxy operations.
//!
//! - Startup errors (rules, CA, access log, binding)
//! - TLS errors (certificate generation, handshake)
//! - Connection errors (upstream connection, forwarding)

use crate::enforce::PlanError;
use crate::policy::PolicyError;
use crate::sandbox::error::CaError;
use crate::telemetry::TelemetryError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed proxy request (CONNECT authority, Host header, URI).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate generation failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(#[from] CaError),

    /// The admission rules could not be read.
    #[error("Failed to load admission rules: {0}")]
    Rules(#[from] PlanError),

    /// The admission rules do not compile to a policy.
    #[error("Invalid admission rules: {0}")]
    Policy(#[from] PolicyError),

    /// The access log could not be opened.
    #[error(transparent)]
    AccessLog(#[from] TelemetryError),

    /// Path visibility is on but no session CA was loaded.
    #[error("TLS interception required for {0} but no session CA is loaded")]
    NoCa(String),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl ProxyError {
    /// Whether this is the peer going away, which is routine for a proxy.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionAborted
            ),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::InvalidRequest("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_upstream_connect_error() {
        let err = ProxyError::UpstreamConnect {
            addr: "api.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("api.example.com:443"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(ProxyError::from(reset).is_disconnect());

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = refused.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
        assert!(!proxy_err.is_disconnect());

        assert!(!ProxyError::Tls("handshake failed".into()).is_disconnect());
    }
}
