//! Container-local redirection rules.
//!
//! Applied inside the execution environment before the user command starts.
//! Outbound TCP 80/443 is rewritten to the proxy's intercept ports, and the
//! filter table drops anything that is neither DNS to a fixed resolver nor
//! TCP to the proxy.

use super::proxy_rules::ADMITTED_PORTS;
use super::rule::{Action, Packet, Protocol, Rule, Table, evaluate};
use super::topology::{Ipv4Cidr, LOOPBACK_NET, NetworkTopology};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Chain the rules are attached to in both tables.
pub const OUTPUT_CHAIN: &str = "OUTPUT";

/// Loopback interface name.
const LOOPBACK_IFACE: &str = "lo";

/// Where an outbound connection ends up after the redirection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Rewritten to a proxy listener.
    Intercepted(SocketAddrV4),
    /// Allowed out unchanged.
    Direct(SocketAddrV4),
    /// Dropped.
    Dropped,
}

/// The redirection rule set for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionRules {
    rules: Vec<Rule>,
}

impl RedirectionRules {
    /// Build the rule set for a topology.
    pub fn build(topology: &NetworkTopology) -> Self {
        let proxy = Ipv4Cidr::host(topology.proxy_ip);
        let nat = |action| Rule::new(Table::Nat, OUTPUT_CHAIN, action);
        let filter = |action| Rule::new(Table::Filter, OUTPUT_CHAIN, action);

        let mut rules = vec![
            nat(Action::Return).out_iface(LOOPBACK_IFACE),
            nat(Action::Return).destination(LOOPBACK_NET),
        ];
        for resolver in &topology.dns_servers {
            rules.push(nat(Action::Return).protocol(Protocol::Udp).to_host(*resolver).dport(53));
        }
        rules.push(nat(Action::Return).destination(proxy));
        for (port, target) in intercept_targets(topology) {
            rules.push(
                nat(Action::Dnat(target))
                    .protocol(Protocol::Tcp)
                    .dport(port),
            );
        }

        rules.push(filter(Action::Accept).out_iface(LOOPBACK_IFACE));
        rules.push(filter(Action::Accept).established());
        for resolver in &topology.dns_servers {
            rules.push(filter(Action::Accept).protocol(Protocol::Udp).to_host(*resolver).dport(53));
        }
        for port in topology.proxy_ports() {
            rules.push(
                filter(Action::Accept)
                    .protocol(Protocol::Tcp)
                    .destination(proxy)
                    .dport(port),
            );
        }
        rules.push(filter(Action::Drop));

        Self { rules }
    }

    /// All rules, nat table first.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules of one table, in order.
    pub fn table(&self, table: Table) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.table == table)
    }

    /// Destination ports that are rewritten, with their targets.
    pub fn dnat_targets(&self) -> impl Iterator<Item = (Option<u16>, SocketAddrV4)> + '_ {
        self.rules.iter().filter_map(|r| match r.action {
            Action::Dnat(target) => Some((r.dport, target)),
            _ => None,
        })
    }

    /// Follow a new outbound connection through nat then filter `OUTPUT`.
    pub fn route(&self, protocol: Protocol, source: Ipv4Addr, destination: SocketAddrV4) -> Route {
        let packet = Packet::new(protocol, source, destination).via_out("eth0");
        let translated = match evaluate(&self.rules, Table::Nat, OUTPUT_CHAIN, &packet) {
            Some(Action::Dnat(target)) => Some(*target),
            _ => None,
        };
        let effective = translated.unwrap_or(destination);
        let packet = Packet::new(protocol, source, effective).via_out("eth0");

        match evaluate(&self.rules, Table::Filter, OUTPUT_CHAIN, &packet) {
            Some(Action::Accept) | None => match translated {
                Some(target) => Route::Intercepted(target),
                None => Route::Direct(destination),
            },
            _ => Route::Dropped,
        }
    }
}

/// Admitted upstream ports and the proxy listener each is redirected to.
pub(crate) fn intercept_targets(topology: &NetworkTopology) -> [(u16, SocketAddrV4); 2] {
    let [http, https] = ADMITTED_PORTS;
    [
        (http, topology.proxy_socket(topology.http_intercept_port)),
        (https, topology.proxy_socket(topology.tls_intercept_port)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn rules() -> (NetworkTopology, RedirectionRules) {
        let topology = NetworkTopology::default();
        let rules = RedirectionRules::build(&topology);
        (topology, rules)
    }

    #[test]
    fn test_web_traffic_is_intercepted() {
        let (topology, rules) = rules();
        assert_eq!(
            rules.route(Protocol::Tcp, topology.exec_ip, sock("140.82.112.3:443")),
            Route::Intercepted(sock("172.30.0.10:3130"))
        );
        assert_eq!(
            rules.route(Protocol::Tcp, topology.exec_ip, sock("93.184.216.34:80")),
            Route::Intercepted(sock("172.30.0.10:3129"))
        );
    }

    #[test]
    fn test_other_ports_are_dropped() {
        let (topology, rules) = rules();
        assert_eq!(
            rules.route(Protocol::Tcp, topology.exec_ip, sock("140.82.112.3:22")),
            Route::Dropped
        );
        assert_eq!(
            rules.route(Protocol::Udp, topology.exec_ip, sock("140.82.112.3:443")),
            Route::Dropped
        );
    }

    #[test]
    fn test_dns_only_to_resolvers() {
        let (topology, rules) = rules();
        assert_eq!(
            rules.route(Protocol::Udp, topology.exec_ip, sock("8.8.8.8:53")),
            Route::Direct(sock("8.8.8.8:53"))
        );
        assert_eq!(
            rules.route(Protocol::Udp, topology.exec_ip, sock("1.1.1.1:53")),
            Route::Dropped
        );
    }

    #[test]
    fn test_proxy_traffic_is_not_redirected() {
        let (topology, rules) = rules();
        assert_eq!(
            rules.route(Protocol::Tcp, topology.exec_ip, sock("172.30.0.10:3128")),
            Route::Direct(sock("172.30.0.10:3128"))
        );
        // The proxy address is passed through even on 443, but nothing listens
        // there and the filter table drops it.
        assert_eq!(
            rules.route(Protocol::Tcp, topology.exec_ip, sock("172.30.0.10:443")),
            Route::Dropped
        );
    }

    #[test]
    fn test_rule_order() {
        let (_, rules) = rules();
        let nat: Vec<_> = rules.table(Table::Nat).collect();
        assert_eq!(nat[0].out_iface.as_deref(), Some("lo"));
        assert!(matches!(nat.last().unwrap().action, Action::Dnat(_)));

        let filter: Vec<_> = rules.table(Table::Filter).collect();
        assert_eq!(filter.last().unwrap().action, Action::Drop);
        assert_eq!(rules.dnat_targets().count(), 2);
    }
}
