//! Host-anchored firewall rules.
//!
//! These bind every network stack attached to the session bridge, not just
//! the execution container, so a sibling container or an IP-literal
//! connection cannot route around the proxy. The rules live in one
//! per-session chain hooked from Docker's `DOCKER-USER` chain for forwarded
//! traffic and from `INPUT` for traffic addressed to the host itself (the
//! bridge gateway and any host service), which makes apply and rollback a
//! single unit.

use super::rule::{Action, Packet, Protocol, Rule, Table, evaluate};
use super::topology::{Ipv4Cidr, NetworkTopology};
use crate::sandbox::naming::SessionId;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Docker's hook point for user rules on forwarded container traffic.
pub const HOOK_CHAIN: &str = "DOCKER-USER";

/// Built-in chain for packets addressed to the host.
pub const INPUT_CHAIN: &str = "INPUT";

/// Where the per-session chain is attached.
///
/// Everything here is derivable from the session id, so a sweep can remove
/// the hook without the rule set that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHook {
    /// Shared chain the forwarding jump is inserted into.
    pub hook_chain: String,
    /// Chain the jump for host-addressed traffic is inserted into.
    pub input_chain: String,
    /// Per-session chain.
    pub chain: String,
    /// Bridge interface whose ingress is captured.
    pub bridge: String,
}

impl HostHook {
    pub fn for_session(id: &SessionId) -> Self {
        Self {
            hook_chain: HOOK_CHAIN.to_string(),
            input_chain: INPUT_CHAIN.to_string(),
            chain: id.chain_name(),
            bridge: id.bridge_name(),
        }
    }

    fn jump_from(&self, chain: &str) -> Rule {
        Rule::new(Table::Filter, chain, Action::Jump(self.chain.clone())).in_iface(&self.bridge)
    }

    /// The jump rules placed at the top of the hook chain and of `INPUT`.
    pub fn jumps(&self) -> [Rule; 2] {
        [
            self.jump_from(&self.hook_chain),
            self.jump_from(&self.input_chain),
        ]
    }
}

/// The host rule group for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRules {
    hook: HostHook,
    rules: Vec<Rule>,
}

impl HostRules {
    /// Build the rule group for a session.
    pub fn build(topology: &NetworkTopology, session: &SessionId) -> Self {
        let hook = HostHook::for_session(session);
        let proxy = Ipv4Cidr::host(topology.proxy_ip);
        let rule = |action| Rule::new(Table::Filter, &hook.chain, action);

        let mut rules = vec![
            rule(Action::Accept).established(),
            // The proxy's own upstream connections.
            rule(Action::Accept).source(proxy),
        ];
        for resolver in &topology.dns_servers {
            rules.push(rule(Action::Accept).protocol(Protocol::Udp).to_host(*resolver).dport(53));
        }
        for port in topology.proxy_ports() {
            rules.push(
                rule(Action::Accept)
                    .protocol(Protocol::Tcp)
                    .destination(proxy)
                    .dport(port),
            );
        }
        rules.push(rule(Action::Log(format!("[{}] ", hook.chain))));
        rules.push(rule(Action::Drop));

        Self { hook, rules }
    }

    pub fn hook(&self) -> &HostHook {
        &self.hook
    }

    /// Per-session chain name.
    pub fn chain(&self) -> &str {
        &self.hook.chain
    }

    /// Rules of the per-session chain, in order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether a new connection entering from the bridge is forwarded.
    pub fn forwards(&self, protocol: Protocol, source: Ipv4Addr, destination: SocketAddrV4) -> bool {
        // Packets that fall through DOCKER-USER are forwarded by Docker.
        self.passes(&self.hook.hook_chain, protocol, source, destination)
    }

    /// Whether a new connection from the bridge to an address of the host
    /// itself is delivered to a local socket.
    pub fn delivers_locally(
        &self,
        protocol: Protocol,
        source: Ipv4Addr,
        destination: SocketAddrV4,
    ) -> bool {
        // The host's own INPUT policy is not ours to know; assume it accepts.
        self.passes(&self.hook.input_chain, protocol, source, destination)
    }

    fn passes(&self, entry: &str, protocol: Protocol, source: Ipv4Addr, destination: SocketAddrV4) -> bool {
        let mut all = Vec::with_capacity(self.rules.len() + 2);
        all.extend(self.hook.jumps());
        all.extend(self.rules.iter().cloned());

        let packet = Packet::new(protocol, source, destination).via_in(&self.hook.bridge);
        !matches!(evaluate(&all, Table::Filter, entry, &packet), Some(Action::Drop))
    }

    /// TCP destinations (address, port) the group accepts from non-proxy sources.
    pub fn tcp_destinations(&self) -> Vec<(Option<Ipv4Cidr>, Option<u16>)> {
        self.rules
            .iter()
            .filter(|r| r.action == Action::Accept && !r.established && r.source.is_none())
            .filter(|r| r.protocol != Some(Protocol::Udp))
            .map(|r| (r.destination, r.dport))
            .collect()
    }
}
