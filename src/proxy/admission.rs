//! Admission decisions, one access record each.
//!
//! Every listener funnels through [`Admission`], so a connection attempt
//! produces exactly one record however it arrived. Terminated TLS
//! connections are the exception: there the record is per request, since
//! each request is decided on its own URL.

use super::error::ProxyError;
use crate::enforce::ProxyAdmissionRules;
use crate::policy::{Policy, Reason, Verdict};
use crate::telemetry::{AccessLog, AccessRecord, Listener};
use std::net::SocketAddr;
use tracing::info;

/// Compiled admission rules plus the log every decision goes to.
pub struct Admission {
    policy: Policy,
    rules: ProxyAdmissionRules,
    log: AccessLog,
}

impl Admission {
    /// Compile `rules` into the policy the proxy enforces.
    pub fn new(rules: ProxyAdmissionRules, log: AccessLog) -> Result<Self, ProxyError> {
        let policy = rules.compile()?;
        Ok(Self { policy, rules, log })
    }

    pub fn rules(&self) -> &ProxyAdmissionRules {
        &self.rules
    }

    /// Decide a connection to `host:port` without inspecting its content.
    pub fn admit_connection(
        &self,
        source: SocketAddr,
        listener: Listener,
        host: &str,
        port: u16,
    ) -> Verdict {
        let verdict = match self.policy.admits_host(host) {
            v if v.is_allowed() && !self.rules.admits_port(port) => {
                Verdict::deny(Reason::PortNotAllowed(port))
            }
            v => v,
        };
        self.log(AccessRecord::new(source, listener, host, &verdict));
        verdict
    }

    /// Decide a single request by its full URL.
    pub fn admit_request(
        &self,
        source: SocketAddr,
        listener: Listener,
        host: &str,
        port: u16,
        url: &str,
    ) -> Verdict {
        let verdict = match self.policy.decide_url(url) {
            v if v.is_allowed() && !self.rules.admits_port(port) => {
                Verdict::deny(Reason::PortNotAllowed(port))
            }
            v => v,
        };
        self.log(AccessRecord::new(source, listener, host, &verdict).with_url(url));
        verdict
    }

    /// Refuse a TLS connection that named no server.
    pub fn deny_unnamed(&self, source: SocketAddr) -> Verdict {
        let verdict = Verdict::deny(Reason::NoServerName);
        self.log(AccessRecord::new(source, Listener::Tls, "", &verdict));
        verdict
    }

    /// Whether TLS to `host` must be terminated so each request's path can
    /// be checked. Records nothing; the per-request decisions do.
    pub fn intercepts(&self, host: &str, port: u16) -> bool {
        self.rules.path_visibility
            && self.rules.admits_port(port)
            && self.policy.requires_path_visibility(host)
    }

    fn log(&self, record: AccessRecord) {
        info!(
            "{} {} {} ({})",
            record.decision,
            record.url.as_deref().unwrap_or(&record.host),
            record.source,
            record.reason
        );
        self.log.record(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::NetworkTopology;
    use crate::policy::{Decision, PolicyBuilder};
    use crate::telemetry::{ACCESS_LOG_FILE, read_records};
    use tempfile::TempDir;

    fn source() -> SocketAddr {
        "172.30.0.20:40000".parse().unwrap()
    }

    fn admission(dir: &TempDir) -> Admission {
        let policy = PolicyBuilder::new()
            .allow(["github.com"])
            .block(["gist.github.com"])
            .allow_urls(["https://api.example.com/v1/*"])
            .build()
            .unwrap();
        let rules = ProxyAdmissionRules::from_policy(&policy, &NetworkTopology::default());
        let log = AccessLog::open(&dir.path().join(ACCESS_LOG_FILE)).unwrap();
        Admission::new(rules, log).unwrap()
    }

    #[test]
    fn test_connection_decisions_are_recorded() {
        let dir = TempDir::new().unwrap();
        let admission = admission(&dir);

        assert!(admission
            .admit_connection(source(), Listener::Forward, "github.com", 443)
            .is_allowed());
        assert_eq!(
            admission
                .admit_connection(source(), Listener::Tls, "gist.github.com", 443)
                .reason,
            Reason::Blocklist("gist.github.com".to_string())
        );
        assert_eq!(
            admission
                .admit_connection(source(), Listener::Forward, "github.com", 22)
                .reason,
            Reason::PortNotAllowed(22)
        );
        admission.deny_unnamed(source());

        let records = read_records(&dir.path().join(ACCESS_LOG_FILE)).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].decision, Decision::Allow);
        assert_eq!(records[1].reason, "blocklist:gist.github.com");
        assert_eq!(records[2].reason, "port-not-allowed:22");
        assert_eq!(records[3].reason, "no-server-name");
    }

    #[test]
    fn test_request_decisions_carry_url() {
        let dir = TempDir::new().unwrap();
        let admission = admission(&dir);

        let allowed = admission.admit_request(
            source(),
            Listener::Tls,
            "api.example.com",
            443,
            "https://api.example.com/v1/models",
        );
        assert!(allowed.is_allowed());

        let denied = admission.admit_request(
            source(),
            Listener::Tls,
            "api.example.com",
            443,
            "https://api.example.com/admin",
        );
        assert_eq!(denied.reason, Reason::UrlNotMatched);

        let records = read_records(&dir.path().join(ACCESS_LOG_FILE)).unwrap();
        assert_eq!(
            records[1].url.as_deref(),
            Some("https://api.example.com/admin")
        );
        assert!(records[1].is_denied());
    }

    #[test]
    fn test_interception_only_for_url_hosts() {
        let dir = TempDir::new().unwrap();
        let admission = admission(&dir);

        assert!(admission.intercepts("api.example.com", 443));
        assert!(!admission.intercepts("api.example.com", 8443));
        assert!(!admission.intercepts("github.com", 443));
        assert!(!admission.intercepts("gist.github.com", 443));
        // Interception decisions are not logged.
        assert!(read_records(&dir.path().join(ACCESS_LOG_FILE))
            .unwrap()
            .is_empty());
    }
}
