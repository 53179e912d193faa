//! Enforcement synthesis.
//!
//! One compiled [`Policy`] is rendered into three rule sets that are
//! enforced independently:
//!
//! - [`ProxyAdmissionRules`]: what the L7 proxy admits;
//! - [`RedirectionRules`]: what the execution environment's own netfilter
//!   intercepts and sends to the proxy;
//! - [`HostRules`]: what the host forwards from anything on the session
//!   bridge.
//!
//! Redirection decides what gets intercepted, the proxy decides what gets
//! admitted, and the host rules stop anything that tries to go around both.
//! All three are built in [`EnforcementPlan::synthesize`], and the plan is
//! only returned after [`EnforcementPlan::verify_consistency`] passes.
//!
//! # Example
//!
//! ```ignore
//! let policy = PolicyBuilder::new().allow(["github.com"]).build()?;
//! let plan = EnforcementPlan::synthesize(&policy, NetworkTopology::default(), &session)?;
//! let files = plan.write_to(&workspace)?;
//! ```

pub mod error;
pub mod host;
pub mod proxy_rules;
pub mod redirect;
pub mod render;
pub mod rule;
pub mod topology;

pub use error::PlanError;
pub use host::{HOOK_CHAIN, HostHook, HostRules, INPUT_CHAIN};
pub use proxy_rules::{ADMITTED_PORTS, ProxyAdmissionRules};
pub use redirect::{RedirectionRules, Route};
pub use render::{IptablesRenderer, RuleRenderer};
pub use rule::{Action, Protocol, Rule, Table};
pub use topology::{Ipv4Cidr, NetworkTopology};

use crate::policy::Policy;
use crate::sandbox::naming::SessionId;
use crate::sandbox::workspace::Workspace;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Proxy admission rules file inside the workspace.
pub const PROXY_RULES_FILE: &str = "proxy-rules.json";
/// Redirection rules file inside the workspace.
pub const REDIRECT_RULES_FILE: &str = "redirect.rules";
/// Host rules file inside the workspace.
pub const HOST_RULES_FILE: &str = "host.rules";

/// Off-network address the rule sets are evaluated against (TEST-NET-3).
const SAMPLE_UPSTREAM: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

/// Ports checked to make sure nothing but the admitted ports leaves.
const OTHER_PORTS: [u16; 5] = [22, 25, 53, 853, 8443];

/// The three rule sets of one run. Immutable once synthesized.
#[derive(Debug, Clone)]
pub struct EnforcementPlan {
    topology: NetworkTopology,
    proxy_rules: ProxyAdmissionRules,
    redirection: RedirectionRules,
    host: HostRules,
}

/// Where [`EnforcementPlan::write_to`] put each artifact.
#[derive(Debug, Clone)]
pub struct PlanFiles {
    pub proxy_rules: PathBuf,
    pub redirect_rules: PathBuf,
    pub host_rules: PathBuf,
}

impl EnforcementPlan {
    /// Derive all three rule sets from one policy.
    ///
    /// # Errors
    ///
    /// [`PlanError::Topology`] for an unusable topology, and
    /// [`PlanError::Inconsistent`] if the layers would disagree.
    pub fn synthesize(
        policy: &Policy,
        topology: NetworkTopology,
        session: &SessionId,
    ) -> Result<Self, PlanError> {
        topology.validate()?;

        let plan = Self {
            proxy_rules: ProxyAdmissionRules::from_policy(policy, &topology),
            redirection: RedirectionRules::build(&topology),
            host: HostRules::build(&topology, session),
            topology,
        };
        plan.verify_consistency()?;

        debug!(
            "Synthesized enforcement plan: {} redirection rules, {} host rules, path visibility {}",
            plan.redirection.rules().len(),
            plan.host.rules().len(),
            plan.proxy_rules.path_visibility
        );
        Ok(plan)
    }

    /// Check that the three layers agree.
    ///
    /// - every port the proxy admits is intercepted and sent to a proxy
    ///   listener;
    /// - every redirection target is the proxy address;
    /// - the execution environment can reach every proxy listener;
    /// - nothing else leaves the container, except DNS to the resolvers;
    /// - the host forwards TCP only from the proxy, for every source on
    ///   the bridge, and lets DNS through to exactly the same resolvers;
    /// - nothing on the bridge but the proxy reaches a service on the host.
    pub fn verify_consistency(&self) -> Result<(), PlanError> {
        let t = &self.topology;
        let fail = |msg: String| Err(PlanError::Inconsistent(msg));
        let upstream = |port| SocketAddrV4::new(SAMPLE_UPSTREAM, port);
        let listeners = [
            self.proxy_rules.listen.http,
            self.proxy_rules.listen.tls,
        ];

        for port in &self.proxy_rules.allowed_ports {
            match self.redirection.route(Protocol::Tcp, t.exec_ip, upstream(*port)) {
                Route::Intercepted(target)
                    if *target.ip() == t.proxy_ip && listeners.contains(&target.port()) => {}
                other => {
                    return fail(format!("admitted port {port} is not intercepted: {other:?}"));
                }
            }
        }

        for (_, target) in self.redirection.dnat_targets() {
            if *target.ip() != t.proxy_ip {
                return fail(format!("redirection target {target} is not the proxy"));
            }
        }

        for port in t.proxy_ports() {
            let listener = t.proxy_socket(port);
            if self.redirection.route(Protocol::Tcp, t.exec_ip, listener) != Route::Direct(listener) {
                return fail(format!("proxy listener {listener} is unreachable"));
            }
        }

        for port in OTHER_PORTS {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                if self.redirection.route(protocol, t.exec_ip, upstream(port)) != Route::Dropped {
                    return fail(format!("{protocol}/{port} leaves the container unfiltered"));
                }
            }
        }

        for resolver in &t.dns_servers {
            let dns = SocketAddrV4::new(*resolver, 53);
            if self.redirection.route(Protocol::Udp, t.exec_ip, dns) != Route::Direct(dns) {
                return fail(format!("resolver {resolver} is unreachable from the container"));
            }
            if !self.host.forwards(Protocol::Udp, t.exec_ip, dns) {
                return fail(format!("resolver {resolver} is blocked on the host"));
            }
        }

        let proxy_host = Some(Ipv4Cidr::host(t.proxy_ip));
        for (destination, _) in self.host.tcp_destinations() {
            if destination != proxy_host {
                return fail(format!(
                    "host rules accept TCP to {destination:?}, not only the proxy"
                ));
            }
        }

        let sibling = Ipv4Addr::from(u32::from(t.subnet.broadcast()) - 1);
        for source in [t.exec_ip, sibling] {
            for port in self.proxy_rules.allowed_ports.iter().copied().chain(OTHER_PORTS) {
                if self.host.forwards(Protocol::Tcp, source, upstream(port)) {
                    return fail(format!("host forwards TCP/{port} from {source} around the proxy"));
                }
            }
        }
        let gateway = |port| SocketAddrV4::new(t.gateway(), port);
        for source in [t.exec_ip, sibling] {
            for port in t.proxy_ports().into_iter().chain(OTHER_PORTS) {
                for protocol in [Protocol::Tcp, Protocol::Udp] {
                    let resolver = protocol == Protocol::Udp
                        && port == 53
                        && t.dns_servers.contains(&t.gateway());
                    if !resolver && self.host.delivers_locally(protocol, source, gateway(port)) {
                        return fail(format!(
                            "host accepts {protocol}/{port} from {source} on {}",
                            t.gateway()
                        ));
                    }
                }
            }
        }
        if !self.host.forwards(Protocol::Tcp, t.proxy_ip, upstream(443)) {
            return fail("host blocks the proxy's own upstream traffic".to_string());
        }

        Ok(())
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn proxy_rules(&self) -> &ProxyAdmissionRules {
        &self.proxy_rules
    }

    pub fn redirection(&self) -> &RedirectionRules {
        &self.redirection
    }

    pub fn host_rules(&self) -> &HostRules {
        &self.host
    }

    /// Whether the proxy must terminate TLS for some hosts.
    pub fn path_visibility(&self) -> bool {
        self.proxy_rules.path_visibility
    }

    /// Write the artifacts with the default renderer.
    pub fn write_to(&self, workspace: &Workspace) -> Result<PlanFiles, PlanError> {
        self.write_with(workspace, &IptablesRenderer)
    }

    /// Write the artifacts with a specific renderer.
    pub fn write_with(
        &self,
        workspace: &Workspace,
        renderer: &dyn RuleRenderer,
    ) -> Result<PlanFiles, PlanError> {
        let files = PlanFiles {
            proxy_rules: workspace.write_file(PROXY_RULES_FILE, &self.proxy_rules.to_json()?)?,
            redirect_rules: workspace
                .write_file(REDIRECT_RULES_FILE, &renderer.render_redirection(&self.redirection))?,
            host_rules: workspace.write_file(HOST_RULES_FILE, &renderer.render_host(&self.host))?,
        };
        debug!("Wrote {} rules to {:?}", renderer.name(), workspace.path());
        Ok(files)
    }
}

/// Load proxy admission rules written by [`EnforcementPlan::write_to`].
pub fn load_proxy_rules(path: &Path) -> Result<ProxyAdmissionRules, PlanError> {
    let json = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ProxyAdmissionRules::from_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyBuilder;

    fn session() -> SessionId {
        SessionId::parse("0badcafe").unwrap()
    }

    fn plan() -> EnforcementPlan {
        let policy = PolicyBuilder::new()
            .allow(["github.com"])
            .block(["gist.github.com"])
            .build()
            .unwrap();
        EnforcementPlan::synthesize(&policy, NetworkTopology::default(), &session()).unwrap()
    }

    #[test]
    fn test_synthesize_default() {
        let plan = plan();
        assert!(!plan.path_visibility());
        assert_eq!(plan.host_rules().chain(), "EW-0badcafe");
        assert_eq!(plan.proxy_rules().allow, vec!["github.com"]);
        plan.verify_consistency().unwrap();
    }

    #[test]
    fn test_synthesize_rejects_bad_topology() {
        let policy = PolicyBuilder::new().build().unwrap();
        let topology = NetworkTopology {
            dns_servers: Vec::new(),
            ..Default::default()
        };
        match EnforcementPlan::synthesize(&policy, topology, &session()) {
            Err(PlanError::Topology(_)) => {}
            other => panic!("Expected Topology error, got {other:?}"),
        }
    }

    #[test]
    fn test_every_admitted_port_is_intercepted() {
        let plan = plan();
        let t = plan.topology();
        for port in ADMITTED_PORTS {
            let route = plan
                .redirection()
                .route(Protocol::Tcp, t.exec_ip, SocketAddrV4::new(SAMPLE_UPSTREAM, port));
            match route {
                Route::Intercepted(target) => assert_eq!(*target.ip(), t.proxy_ip),
                other => panic!("Port {port} not intercepted: {other:?}"),
            }
        }
    }

    #[test]
    fn test_inconsistent_proxy_ports_are_rejected() {
        let mut plan = plan();
        plan.proxy_rules.allowed_ports.push(8080);
        match plan.verify_consistency() {
            Err(PlanError::Inconsistent(msg)) => assert!(msg.contains("8080")),
            other => panic!("Expected Inconsistent, got {other:?}"),
        }
    }

    #[test]
    fn test_inconsistent_host_rules_are_rejected() {
        let mut plan = plan();
        let mut topology = plan.topology.clone();
        topology.proxy_ip = Ipv4Addr::new(172, 30, 0, 11);
        plan.host = HostRules::build(&topology, &session());
        assert!(matches!(
            plan.verify_consistency(),
            Err(PlanError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_host_rules_opening_the_gateway_are_rejected() {
        let mut plan = plan();
        let mut topology = plan.topology.clone();
        topology.dns_servers.push(topology.gateway());
        plan.host = HostRules::build(&topology, &session());
        assert!(matches!(
            plan.verify_consistency(),
            Err(PlanError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_write_to_workspace() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create_in(root.path(), &session()).unwrap();
        let files = plan().write_to(&workspace).unwrap();

        let redirect = std::fs::read_to_string(&files.redirect_rules).unwrap();
        assert!(redirect.contains("DNAT"));
        let host = std::fs::read_to_string(&files.host_rules).unwrap();
        assert!(host.contains("EW-0badcafe"));

        let rules = load_proxy_rules(&files.proxy_rules).unwrap();
        assert_eq!(rules.block, vec!["gist.github.com"]);
    }

    #[test]
    fn test_load_missing_rules() {
        let result = load_proxy_rules(Path::new("/nonexistent/proxy-rules.json"));
        assert!(matches!(result, Err(PlanError::Read { .. })));
    }
}
