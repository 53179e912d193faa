//! Per-run resource naming.
//!
//! Every resource a run creates is derivable from its [`SessionId`]:
//!
//! | Resource             | Name                      |
//! |----------------------|---------------------------|
//! | isolated network     | `run-<id>-network`        |
//! | bridge interface     | `run-<id>-br`             |
//! | proxy container      | `run-<id>-proxy`          |
//! | namespace holder     | `run-<id>-netns`          |
//! | execution container  | `run-<id>-exec`           |
//! | host firewall chain  | `EW-<id>`                 |
//! | workspace directory  | `$TMPDIR/run-<id>-workspace` |
//!
//! Containers and networks also carry the [`LABEL_SESSION`] and
//! [`LABEL_OWNER_PID`] labels. The sweeps in [`super::cleanup`] find
//! leftovers from these names and labels alone, without any in-memory state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every per-run resource name.
pub const RESOURCE_PREFIX: &str = "run-";

/// Prefix of per-run host firewall chains.
pub const CHAIN_PREFIX: &str = "EW-";

/// Label carrying the session id.
pub const LABEL_SESSION: &str = "egress-warden.session";

/// Label carrying the PID of the process that owns the session.
pub const LABEL_OWNER_PID: &str = "egress-warden.owner-pid";

/// Length of a session id in hex characters.
///
/// Kept short so `run-<id>-br` fits the 15 byte interface name limit.
pub const SESSION_ID_LEN: usize = 8;

/// Linux interface name limit (IFNAMSIZ - 1).
const MAX_IFACE_NAME: usize = 15;

/// Identifier of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

/// Role of a named per-run resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    /// The isolated network.
    Network,
    /// The bridge interface backing the network.
    Bridge,
    /// The proxy container.
    Proxy,
    /// The container holding the execution environment's network namespace.
    Netns,
    /// The execution container.
    Exec,
    /// The workspace directory.
    Workspace,
}

impl ResourceRole {
    fn suffix(self) -> &'static str {
        match self {
            ResourceRole::Network => "network",
            ResourceRole::Bridge => "br",
            ResourceRole::Proxy => "proxy",
            ResourceRole::Netns => "netns",
            ResourceRole::Exec => "exec",
            ResourceRole::Workspace => "workspace",
        }
    }

    const ALL: [ResourceRole; 6] = [
        ResourceRole::Network,
        ResourceRole::Bridge,
        ResourceRole::Proxy,
        ResourceRole::Netns,
        ResourceRole::Exec,
        ResourceRole::Workspace,
    ];
}

impl SessionId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..SESSION_ID_LEN].to_string())
    }

    /// Parse an id, accepting only [`SESSION_ID_LEN`] lowercase hex digits.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == SESSION_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(raw.to_string()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the resource with the given role.
    pub fn resource_name(&self, role: ResourceRole) -> String {
        format!("{RESOURCE_PREFIX}{}-{}", self.0, role.suffix())
    }

    /// `run-<id>-network`
    pub fn network_name(&self) -> String {
        self.resource_name(ResourceRole::Network)
    }

    /// `run-<id>-br`
    pub fn bridge_name(&self) -> String {
        let name = self.resource_name(ResourceRole::Bridge);
        debug_assert!(name.len() <= MAX_IFACE_NAME);
        name
    }

    /// `run-<id>-proxy`
    pub fn proxy_container(&self) -> String {
        self.resource_name(ResourceRole::Proxy)
    }

    /// `run-<id>-netns`
    pub fn netns_container(&self) -> String {
        self.resource_name(ResourceRole::Netns)
    }

    /// `run-<id>-exec`
    pub fn exec_container(&self) -> String {
        self.resource_name(ResourceRole::Exec)
    }

    /// `run-<id>-workspace`
    pub fn workspace_dir_name(&self) -> String {
        self.resource_name(ResourceRole::Workspace)
    }

    /// `EW-<id>`
    pub fn chain_name(&self) -> String {
        format!("{CHAIN_PREFIX}{}", self.0)
    }

    /// Recover the session id and role from a resource name.
    pub fn from_resource_name(name: &str) -> Option<(Self, ResourceRole)> {
        let rest = name.strip_prefix(RESOURCE_PREFIX)?;
        let (id, suffix) = rest.split_once('-')?;
        let id = Self::parse(id)?;
        let role = ResourceRole::ALL
            .into_iter()
            .find(|role| role.suffix() == suffix)?;
        Some((id, role))
    }

    /// Recover the session id from a host chain name.
    pub fn from_chain_name(name: &str) -> Option<Self> {
        Self::parse(name.strip_prefix(CHAIN_PREFIX)?)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid session id: {value:?}"))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_valid() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_LEN);
        assert!(SessionId::parse(id.as_str()).is_some());
    }

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(SessionId::parse("abc").is_none());
        assert!(SessionId::parse("ABCDEF12").is_none());
        assert!(SessionId::parse("abcdefgh").is_none());
        assert!(SessionId::parse("abcdef123").is_none());
    }

    #[test]
    fn test_resource_names() {
        let id = SessionId::parse("0badcafe").unwrap();
        assert_eq!(id.network_name(), "run-0badcafe-network");
        assert_eq!(id.proxy_container(), "run-0badcafe-proxy");
        assert_eq!(id.exec_container(), "run-0badcafe-exec");
        assert_eq!(id.netns_container(), "run-0badcafe-netns");
        assert_eq!(id.workspace_dir_name(), "run-0badcafe-workspace");
        assert_eq!(id.chain_name(), "EW-0badcafe");
        assert_eq!(id.bridge_name(), "run-0badcafe-br");
        assert!(id.bridge_name().len() <= MAX_IFACE_NAME);
    }

    #[test]
    fn test_from_resource_name() {
        let (id, role) = SessionId::from_resource_name("run-0badcafe-proxy").unwrap();
        assert_eq!(id.as_str(), "0badcafe");
        assert_eq!(role, ResourceRole::Proxy);

        assert!(SessionId::from_resource_name("run-0badcafe-other").is_none());
        assert!(SessionId::from_resource_name("awf-squid").is_none());
        assert!(SessionId::from_resource_name("run-xyz-proxy").is_none());
    }

    #[test]
    fn test_from_chain_name() {
        assert_eq!(
            SessionId::from_chain_name("EW-0badcafe").map(|id| id.to_string()),
            Some("0badcafe".to_string())
        );
        assert!(SessionId::from_chain_name("DOCKER-USER").is_none());
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let id: SessionId = serde_json::from_str("\"0badcafe\"").unwrap();
        assert_eq!(id.as_str(), "0badcafe");
        assert!(serde_json::from_str::<SessionId>("\"nope\"").is_err());
    }
}
