//! L7 admission rules handed to the proxy.
//!
//! The proxy runs in its own container and receives the policy as JSON. It
//! rebuilds the [`Policy`] from these entries through [`PolicyBuilder`], so
//! the proxy and the CLI evaluate domains with the same code.

use super::topology::NetworkTopology;
use crate::policy::{Policy, PolicyBuilder, PolicyError};
use serde::{Deserialize, Serialize};

/// Ports the proxy admits traffic to.
pub const ADMITTED_PORTS: [u16; 2] = [80, 443];

/// Outcome when no rule matches. Only `Deny` exists: admission is
/// default-deny by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Deny,
}

/// Ports the proxy listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenPorts {
    /// Explicit forward proxy.
    pub forward: u16,
    /// Redirected plain HTTP.
    pub http: u16,
    /// Redirected TLS.
    pub tls: u16,
}

/// Serialized admission rules.
///
/// Evaluation is block set, then allow set, then `default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAdmissionRules {
    /// Block patterns in canonical order.
    pub block: Vec<String>,
    /// Allow patterns in canonical order.
    pub allow: Vec<String>,
    /// What happens when nothing matches.
    pub default: DefaultAction,
    /// Upstream ports a connection may target.
    pub allowed_ports: Vec<u16>,
    /// HTTPS URL patterns checked per request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url_patterns: Vec<String>,
    /// Whether TLS to URL-pattern hosts is decrypted to expose paths.
    pub path_visibility: bool,
    /// Listener ports.
    pub listen: ListenPorts,
}

impl ProxyAdmissionRules {
    /// Derive the admission rules from a compiled policy.
    pub fn from_policy(policy: &Policy, topology: &NetworkTopology) -> Self {
        let patterns = |rules: &[crate::policy::DomainRule]| {
            rules.iter().map(|r| r.pattern().to_string()).collect()
        };
        let url_patterns: Vec<String> = policy
            .url_patterns()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();

        Self {
            block: patterns(policy.block_rules()),
            allow: patterns(policy.allow_rules()),
            default: DefaultAction::Deny,
            allowed_ports: ADMITTED_PORTS.to_vec(),
            path_visibility: !url_patterns.is_empty(),
            url_patterns,
            listen: ListenPorts {
                forward: topology.forward_port,
                http: topology.http_intercept_port,
                tls: topology.tls_intercept_port,
            },
        }
    }

    /// Rebuild the policy these rules were derived from.
    pub fn compile(&self) -> Result<Policy, PolicyError> {
        PolicyBuilder::new()
            .block(&self.block)
            .allow(&self.allow)
            .allow_urls(&self.url_patterns)
            .build()
    }

    /// Whether connections to `port` may be admitted at all.
    pub fn admits_port(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
