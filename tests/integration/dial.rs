//! Outbound dialing: dedup, address-family preference, admission, seeding.

use meridian_core::config::DiscoveryConfig;
use meridian_net::{DialError, DialOutcome, Direction};

use crate::infra::*;

#[tokio::test]
async fn dial_to_connected_host_is_a_no_op() {
    let target = start_server(network(4)).await;
    let port = loopback(&target).port();

    let resolver = StaticResolver::default().host("node.test", &["127.0.0.1"]);
    let dialer = builder(network(4), resolver).build();

    let first = dialer.dial(&format!("node.test:{port}")).await.unwrap();
    assert!(matches!(first, DialOutcome::Connected(_)));

    // Same host by name and by literal: no new connection either way.
    assert_eq!(
        dialer.dial(&format!("node.test:{port}")).await.unwrap(),
        DialOutcome::AlreadyConnected
    );
    assert_eq!(
        dialer.dial(&format!("127.0.0.1:{port}")).await.unwrap(),
        DialOutcome::AlreadyConnected
    );
    assert_eq!(dialer.peer_count().await, 1);
    eventually("target saw one inbound", || async { target.peer_count().await == 1 }).await;

    let peer = dialer.peers().await.pop().unwrap();
    assert_eq!(peer.direction(), Direction::Outbound);

    dialer.stop().await;
    target.stop().await;
}

#[tokio::test]
async fn mixed_families_dial_ipv4() {
    let target = start_server(network(4)).await;
    let port = loopback(&target).port();

    let resolver =
        StaticResolver::default().host("mixed.test", &["2001:db8::1", "127.0.0.1", "2001:db8::2"]);
    let dialer = builder(network(4), resolver).build();

    let outcome = dialer.dial(&format!("mixed.test:{port}")).await.unwrap();
    assert!(matches!(outcome, DialOutcome::Connected(_)));
    let peer = dialer.peers().await.pop().unwrap();
    assert!(peer.remote().is_ipv4());

    dialer.stop().await;
    target.stop().await;
}

#[tokio::test]
async fn ipv6_only_host_has_no_usable_address() {
    let resolver = StaticResolver::default().host("v6.test", &["2001:db8::1", "2001:db8::2"]);
    let dialer = builder(network(4), resolver).build();

    let err = dialer.dial("v6.test:30303").await.unwrap_err();
    assert!(matches!(err, DialError::NoUsableAddress), "got {err}");
    assert_eq!(dialer.peer_count().await, 0);
}

#[tokio::test]
async fn unresolvable_host_is_returned_to_caller() {
    let dialer = builder(network(4), StaticResolver::default()).build();
    let err = dialer.dial("nowhere.test:30303").await.unwrap_err();
    assert!(matches!(err, DialError::Resolve { .. }), "got {err}");
}

#[tokio::test]
async fn full_registry_refuses_dial() {
    let a = start_server(network(4)).await;
    let b = start_server(network(4)).await;
    let dialer = builder(network(1), StaticResolver::default()).build();

    dialer.dial(&loopback(&a).to_string()).await.unwrap();
    let err = dialer.dial(&loopback(&b).to_string()).await.unwrap_err();
    assert!(matches!(err, DialError::RegistryFull), "got {err}");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let dialer = builder(network(4), StaticResolver::default()).build();
    let err = dialer.dial(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, DialError::Connect(_)), "got {err}");
}

#[tokio::test]
async fn seeding_dials_srv_targets_and_survives_failures() {
    let target = start_server(network(4)).await;
    let port = loopback(&target).port();

    // Bootstrap host points at a dead port; the SRV record at the live one.
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let resolver = StaticResolver::default()
        .host("bootstrap.test", &["127.0.0.1"])
        .srv("_p2p._tcp.test", &[("node.test", port)])
        .host("node.test", &["127.0.0.1"]);
    let seeder = builder(network(4), resolver)
        .discovery(DiscoveryConfig {
            bootstrap_host: "bootstrap.test".into(),
            srv_name: "_p2p._tcp.test".into(),
            fallback_seed: format!("127.0.0.1:{dead_port}"),
            default_port: dead_port,
        })
        .build();

    assert_eq!(seeder.seed().await, 1);
    assert_eq!(seeder.peer_count().await, 1);
    eventually("target saw the seeder", || async { target.peer_count().await == 1 }).await;

    seeder.stop().await;
    target.stop().await;
}

#[tokio::test]
async fn start_with_seed_runs_discovery_in_background() {
    let target = start_server(network(4)).await;

    let seeder = builder(network(4), StaticResolver::default())
        .discovery(DiscoveryConfig {
            bootstrap_host: "bootstrap.test".into(),
            srv_name: "_p2p._tcp.test".into(),
            fallback_seed: loopback(&target).to_string(),
            default_port: 30303,
        })
        .build();
    seeder.start(0, true).await;

    eventually("fallback seed connected", || async { seeder.peer_count().await == 1 }).await;

    seeder.stop().await;
    target.stop().await;
}
