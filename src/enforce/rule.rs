//! Typed packet-filter rules.
//!
//! Rule sets are built from these values and only turned into text by a
//! [`RuleRenderer`](super::render::RuleRenderer). The same values can be
//! evaluated against a synthetic [`Packet`], which is how the plan checks that
//! its layers agree without parsing any rendered output.

use super::topology::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Netfilter table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// Address translation.
    Nat,
    /// Packet filtering.
    Filter,
}

impl Table {
    /// Table name as netfilter spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

/// Transport protocol match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// What happens to a matching packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Accept,
    Drop,
    /// Leave the current chain.
    Return,
    /// Rewrite the destination.
    Dnat(SocketAddrV4),
    /// Log with the given prefix and keep evaluating.
    Log(String),
    /// Continue in another chain.
    Jump(String),
}

impl Action {
    /// Whether evaluation stops at this action.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Action::Log(_) | Action::Jump(_))
    }
}

/// One rule: a set of matches and an action.
///
/// Unset matches match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub protocol: Option<Protocol>,
    pub source: Option<Ipv4Cidr>,
    pub destination: Option<Ipv4Cidr>,
    pub dport: Option<u16>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    /// Match only packets of established or related connections.
    pub established: bool,
    pub action: Action,
}

impl Rule {
    /// A rule matching every packet in `chain`.
    pub fn new(table: Table, chain: impl Into<String>, action: Action) -> Self {
        Self {
            table,
            chain: chain.into(),
            protocol: None,
            source: None,
            destination: None,
            dport: None,
            in_iface: None,
            out_iface: None,
            established: false,
            action,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn source(mut self, source: Ipv4Cidr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn destination(mut self, destination: Ipv4Cidr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Match a single destination host.
    pub fn to_host(self, ip: Ipv4Addr) -> Self {
        self.destination(Ipv4Cidr::host(ip))
    }

    /// Match a destination port. Requires a protocol.
    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    pub fn in_iface(mut self, iface: impl Into<String>) -> Self {
        self.in_iface = Some(iface.into());
        self
    }

    pub fn out_iface(mut self, iface: impl Into<String>) -> Self {
        self.out_iface = Some(iface.into());
        self
    }

    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }

    /// Whether `packet` satisfies every match of this rule.
    pub fn matches(&self, packet: &Packet) -> bool {
        if self.established && !packet.established {
            return false;
        }
        if self.protocol.is_some_and(|p| p != packet.protocol) {
            return false;
        }
        if self.source.is_some_and(|s| !s.contains(packet.source)) {
            return false;
        }
        if self.destination.is_some_and(|d| !d.contains(packet.destination)) {
            return false;
        }
        if self.dport.is_some_and(|p| p != packet.dport) {
            return false;
        }
        if let Some(iface) = &self.in_iface
            && packet.in_iface.as_deref() != Some(iface.as_str())
        {
            return false;
        }
        if let Some(iface) = &self.out_iface
            && packet.out_iface.as_deref() != Some(iface.as_str())
        {
            return false;
        }
        true
    }
}

/// A synthetic packet used to evaluate rule sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub dport: u16,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub established: bool,
}

impl Packet {
    /// A new outbound connection attempt.
    pub fn new(protocol: Protocol, source: Ipv4Addr, destination: SocketAddrV4) -> Self {
        Self {
            protocol,
            source,
            destination: *destination.ip(),
            dport: destination.port(),
            in_iface: None,
            out_iface: None,
            established: false,
        }
    }

    pub fn via_in(mut self, iface: impl Into<String>) -> Self {
        self.in_iface = Some(iface.into());
        self
    }

    pub fn via_out(mut self, iface: impl Into<String>) -> Self {
        self.out_iface = Some(iface.into());
        self
    }
}

/// First terminal action for `packet` in `chain`, following jumps.
///
/// Returns `None` when the packet falls off the end of the chain, which
/// means the caller's chain policy applies.
pub fn evaluate<'a>(rules: &'a [Rule], table: Table, chain: &str, packet: &Packet) -> Option<&'a Action> {
    evaluate_depth(rules, table, chain, packet, 0)
}

fn evaluate_depth<'a>(
    rules: &'a [Rule],
    table: Table,
    chain: &str,
    packet: &Packet,
    depth: usize,
) -> Option<&'a Action> {
    // Rule sets never nest more than one level; anything deeper is a loop.
    if depth > 4 {
        return None;
    }
    for rule in rules
        .iter()
        .filter(|r| r.table == table && r.chain == chain && r.matches(packet))
    {
        match &rule.action {
            Action::Log(_) => continue,
            Action::Jump(target) => {
                match evaluate_depth(rules, table, target, packet, depth + 1) {
                    Some(Action::Return) | None => continue,
                    Some(action) => return Some(action),
                }
            }
            action => return Some(action),
        }
    }
    None
}
