//! Fixed addressing for the isolated network.
//!
//! Rules reference these addresses directly, so they can be rendered before
//! any container exists and before any name resolution is possible.

use super::error::PlanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// Default subnet of the isolated network.
pub const DEFAULT_SUBNET: &str = "172.30.0.0/24";
/// Default proxy address.
pub const DEFAULT_PROXY_IP: Ipv4Addr = Ipv4Addr::new(172, 30, 0, 10);
/// Default execution environment address.
pub const DEFAULT_EXEC_IP: Ipv4Addr = Ipv4Addr::new(172, 30, 0, 20);
/// Explicit forward-proxy port (`HTTP_PROXY` / `HTTPS_PROXY`).
pub const FORWARD_PORT: u16 = 3128;
/// Port receiving redirected plain HTTP.
pub const HTTP_INTERCEPT_PORT: u16 = 3129;
/// Port receiving redirected TLS.
pub const TLS_INTERCEPT_PORT: u16 = 3130;

/// `127.0.0.0/8`
pub const LOOPBACK_NET: Ipv4Cidr = Ipv4Cidr {
    addr: Ipv4Addr::new(127, 0, 0, 0),
    prefix: 8,
};

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build a CIDR, rejecting prefixes above 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, PlanError> {
        if prefix > 32 {
            return Err(PlanError::Topology(format!("prefix /{prefix} is out of range")));
        }
        Ok(Self { addr, prefix })
    }

    /// A single host (`/32`).
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, prefix: 32 }
    }

    /// The address part as written.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    /// The network address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    /// Whether `ip` lies inside this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }

    /// First usable host, used by Docker as the bridge gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(1))
    }

    /// The broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.mask())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PlanError::Topology(format!("invalid CIDR: {s:?}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

/// Addresses and ports of one run's isolated network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// Subnet of the isolated network.
    pub subnet: Ipv4Cidr,
    /// Address of the proxy container.
    pub proxy_ip: Ipv4Addr,
    /// Address of the execution container.
    pub exec_ip: Ipv4Addr,
    /// The only resolvers DNS may reach.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Explicit forward-proxy port.
    pub forward_port: u16,
    /// Port receiving redirected port 80 traffic.
    pub http_intercept_port: u16,
    /// Port receiving redirected port 443 traffic.
    pub tls_intercept_port: u16,
}

impl Default for NetworkTopology {
    fn default() -> Self {
        Self {
            subnet: Ipv4Cidr {
                addr: Ipv4Addr::new(172, 30, 0, 0),
                prefix: 24,
            },
            proxy_ip: DEFAULT_PROXY_IP,
            exec_ip: DEFAULT_EXEC_IP,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            forward_port: FORWARD_PORT,
            http_intercept_port: HTTP_INTERCEPT_PORT,
            tls_intercept_port: TLS_INTERCEPT_PORT,
        }
    }
}

impl NetworkTopology {
    /// Check that the addresses fit the subnet and do not collide.
    pub fn validate(&self) -> Result<(), PlanError> {
        let subnet = self.subnet;
        if subnet.prefix() > 29 {
            return Err(PlanError::Topology(format!(
                "subnet {subnet} is too small for a gateway, proxy and execution environment"
            )));
        }

        for (role, ip) in [("proxy", self.proxy_ip), ("execution", self.exec_ip)] {
            if !subnet.contains(ip) {
                return Err(PlanError::Topology(format!(
                    "{role} address {ip} is outside {subnet}"
                )));
            }
            if ip == subnet.network() || ip == subnet.gateway() || ip == subnet.broadcast() {
                return Err(PlanError::Topology(format!(
                    "{role} address {ip} collides with the network, gateway or broadcast address"
                )));
            }
        }
        if self.proxy_ip == self.exec_ip {
            return Err(PlanError::Topology(
                "proxy and execution environment share an address".to_string(),
            ));
        }
        if self.dns_servers.is_empty() {
            return Err(PlanError::Topology("no DNS resolvers configured".to_string()));
        }

        let ports = self.proxy_ports();
        if ports.iter().any(|p| *p == 0)
            || ports[0] == ports[1]
            || ports[1] == ports[2]
            || ports[0] == ports[2]
        {
            return Err(PlanError::Topology(format!(
                "proxy ports must be distinct and non-zero: {ports:?}"
            )));
        }

        Ok(())
    }

    /// Forward, HTTP-intercept and TLS-intercept ports, in that order.
    pub fn proxy_ports(&self) -> [u16; 3] {
        [
            self.forward_port,
            self.http_intercept_port,
            self.tls_intercept_port,
        ]
    }

    /// The Docker gateway of the subnet.
    pub fn gateway(&self) -> Ipv4Addr {
        self.subnet.gateway()
    }

    /// `http://<proxy>:<forward_port>`, for `HTTP_PROXY` and friends.
    pub fn forward_proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy_ip, self.forward_port)
    }

    /// Socket address of a proxy port.
    pub fn proxy_socket(&self, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(self.proxy_ip, port)
    }
}
