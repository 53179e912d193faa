//! Proxy readiness polling.

use super::error::HealthCheckError;
use std::future::Future;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default number of checks before giving up.
pub const DEFAULT_RETRIES: u32 = 30;

/// Default delay between checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Checks whether a service is ready.
pub trait HealthChecker: Send + Sync {
    /// One readiness check. `Err` carries a human-readable reason.
    fn check(&self, target: SocketAddrV4) -> impl Future<Output = Result<(), String>> + Send;
}

/// Ready means "accepts a TCP connection".
#[derive(Debug, Clone)]
pub struct TcpChecker {
    pub connect_timeout: Duration,
}

impl Default for TcpChecker {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl HealthChecker for TcpChecker {
    async fn check(&self, target: SocketAddrV4) -> Result<(), String> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", self.connect_timeout)),
        }
    }
}

/// Poll `target` until it is ready, at most `retries` times.
pub async fn wait_healthy<P: HealthChecker>(
    checker: &P,
    target: SocketAddrV4,
    retries: u32,
    interval: Duration,
) -> Result<(), HealthCheckError> {
    let attempts = retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match checker.check(target).await {
            Ok(()) => {
                debug!("{} ready after {} attempt(s)", target, attempt);
                return Ok(());
            }
            Err(e) => {
                debug!("{} not ready (attempt {}/{}): {}", target, attempt, attempts, e);
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(HealthCheckError {
        target,
        attempts,
        last_error,
    })
}
