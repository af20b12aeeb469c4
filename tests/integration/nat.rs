//! Server-driven NAT lease renewal against a recording port mapper.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use meridian_core::config::NetworkConfig;
use meridian_net::{NatError, PortMapper, Protocol};

use crate::infra::*;

/// Accepts every mapping and records what it was asked to do.
#[derive(Default)]
pub struct RecordingMapper {
    calls: Mutex<Vec<String>>,
}

impl RecordingMapper {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PortMapper for RecordingMapper {
    fn add_port_mapping<'a>(
        &'a self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        _description: &'a str,
        lease_secs: u32,
    ) -> BoxFuture<'a, Result<(), NatError>> {
        self.record(format!("add {protocol:?} {internal_port}->{external_port} {lease_secs}"));
        Box::pin(async { Ok(()) })
    }

    fn external_address(&self) -> BoxFuture<'_, Result<IpAddr, NatError>> {
        self.record("external".into());
        Box::pin(async { Ok("203.0.113.50".parse().unwrap()) })
    }

    fn delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> BoxFuture<'_, Result<(), NatError>> {
        self.record(format!("delete {protocol:?} {external_port}"));
        Box::pin(async { Ok(()) })
    }
}

fn with_lease() -> NetworkConfig {
    NetworkConfig {
        nat_lease_secs: 600,
        nat_renew_interval_secs: 3600,
        ..network(4)
    }
}

#[tokio::test]
async fn listening_port_is_mapped_and_released() {
    let mapper = Arc::new(RecordingMapper::default());
    let server = start_with(
        builder(with_lease(), StaticResolver::default()).port_mapper(mapper.clone()),
    )
    .await;
    let port = server.local_addr().unwrap().port();

    eventually("external address recorded", || async {
        server.external_ip().is_some()
    })
    .await;
    assert_eq!(server.external_ip(), Some("203.0.113.50".parse().unwrap()));
    assert_eq!(
        mapper.calls(),
        vec![format!("add Tcp {port}->{port} 600"), "external".to_string()]
    );

    server.stop().await;
    let delete = format!("delete Tcp {port}");
    eventually("mapping deleted", || async { mapper.calls().contains(&delete) }).await;
}

#[tokio::test]
async fn no_mapping_without_a_listener() {
    let squatter = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = squatter.local_addr().unwrap().port();

    let mapper = Arc::new(RecordingMapper::default());
    let server = builder(with_lease(), StaticResolver::default())
        .port_mapper(mapper.clone())
        .build();
    server.start(taken, false).await;
    assert!(!server.is_listening());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(mapper.calls().is_empty());
    assert!(server.external_ip().is_none());

    server.stop().await;
}
