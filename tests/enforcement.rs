//! The three enforcement layers derived from one policy must agree.

use std::net::{Ipv4Addr, SocketAddrV4};

use egress_warden::enforce::{
    ADMITTED_PORTS, EnforcementPlan, Ipv4Cidr, NetworkTopology, Protocol, Route,
};
use egress_warden::policy::PolicyBuilder;
use egress_warden::sandbox::SessionId;
use proptest::prelude::*;

fn session() -> SessionId {
    SessionId::parse("0badcafe").unwrap()
}

#[test]
fn every_admitted_port_reaches_a_proxy_listener() {
    let policy = PolicyBuilder::new()
        .allow(["github.com", "*.npmjs.org"])
        .build()
        .unwrap();
    let topology = NetworkTopology::default();
    let plan = EnforcementPlan::synthesize(&policy, topology.clone(), &session()).unwrap();

    let listeners = [topology.http_intercept_port, topology.tls_intercept_port];
    for port in ADMITTED_PORTS {
        let upstream = SocketAddrV4::new(Ipv4Addr::new(140, 82, 112, 3), port);
        match plan.redirection().route(Protocol::Tcp, topology.exec_ip, upstream) {
            Route::Intercepted(target) => {
                assert_eq!(*target.ip(), topology.proxy_ip);
                assert!(listeners.contains(&target.port()));
            }
            other => panic!("port {port} is not intercepted: {other:?}"),
        }
    }
}

#[test]
fn host_rules_only_forward_tcp_from_the_proxy() {
    let policy = PolicyBuilder::new().allow(["github.com"]).build().unwrap();
    let topology = NetworkTopology::default();
    let plan = EnforcementPlan::synthesize(&policy, topology.clone(), &session()).unwrap();
    let upstream = SocketAddrV4::new(Ipv4Addr::new(140, 82, 112, 3), 443);

    assert!(plan.host_rules().forwards(Protocol::Tcp, topology.proxy_ip, upstream));
    assert!(!plan.host_rules().forwards(Protocol::Tcp, topology.exec_ip, upstream));

    let proxy_only = Some(Ipv4Cidr::host(topology.proxy_ip));
    for (destination, _) in plan.host_rules().tcp_destinations() {
        assert_eq!(destination, proxy_only);
    }
}

#[test]
fn dns_is_limited_to_the_configured_resolvers() {
    let policy = PolicyBuilder::new().allow(["github.com"]).build().unwrap();
    let topology = NetworkTopology {
        dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
        ..NetworkTopology::default()
    };
    let plan = EnforcementPlan::synthesize(&policy, topology.clone(), &session()).unwrap();

    let allowed = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53);
    let other = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
    assert_eq!(
        plan.redirection().route(Protocol::Udp, topology.exec_ip, allowed),
        Route::Direct(allowed)
    );
    assert_eq!(
        plan.redirection().route(Protocol::Udp, topology.exec_ip, other),
        Route::Dropped
    );
}

#[test]
fn url_patterns_turn_on_path_visibility() {
    let topology = NetworkTopology::default();
    let plain = PolicyBuilder::new().allow(["github.com"]).build().unwrap();
    let with_urls = PolicyBuilder::new()
        .allow_urls(["https://api.github.com/repos/org/*"])
        .build()
        .unwrap();

    let plan = EnforcementPlan::synthesize(&plain, topology.clone(), &session()).unwrap();
    assert!(!plan.path_visibility());

    let plan = EnforcementPlan::synthesize(&with_urls, topology, &session()).unwrap();
    assert!(plan.path_visibility());
    assert_eq!(plan.proxy_rules().url_patterns.len(), 1);
}

fn domain() -> impl Strategy<Value = String> {
    ("[a-z]{2,10}", prop::sample::select(vec!["com", "org", "io", "dev"]))
        .prop_map(|(label, tld)| format!("{label}.{tld}"))
}

proptest! {
    #[test]
    fn plans_are_consistent_for_any_policy_and_subnet(
        allow in prop::collection::vec(domain(), 0..8),
        block in prop::collection::vec(domain(), 0..4),
        second in 0u8..=255,
        third in 0u8..=255,
    ) {
        let policy = PolicyBuilder::new().allow(&allow).block(&block).build().unwrap();
        let subnet = Ipv4Cidr::new(Ipv4Addr::new(10, second, third, 0), 24).unwrap();
        let topology = NetworkTopology {
            subnet,
            proxy_ip: Ipv4Addr::new(10, second, third, 10),
            exec_ip: Ipv4Addr::new(10, second, third, 20),
            ..NetworkTopology::default()
        };

        let plan = EnforcementPlan::synthesize(&policy, topology, &session());
        prop_assert!(plan.is_ok(), "{:?}", plan.err());
        prop_assert!(plan.unwrap().verify_consistency().is_ok());
    }
}
