//! NAT port mapping: the capability contract, a UPnP implementation, and the
//! lease renewal loop the server runs against it.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

const MAPPING_DESCRIPTION: &str = "meridian p2p";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("gateway discovery failed: {0}")]
    Search(#[from] igd_next::SearchError),
    #[error("add port mapping failed: {0}")]
    AddPort(#[from] igd_next::AddPortError),
    #[error("external address query failed: {0}")]
    ExternalIp(#[from] igd_next::GetExternalIpError),
    #[error("remove port mapping failed: {0}")]
    RemovePort(#[from] igd_next::RemovePortError),
    #[error("local address probe failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Port mapping on the network edge.
pub trait PortMapper: Send + Sync {
    fn add_port_mapping<'a>(
        &'a self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        description: &'a str,
        lease_secs: u32,
    ) -> BoxFuture<'a, Result<(), NatError>>;

    fn external_address(&self) -> BoxFuture<'_, Result<IpAddr, NatError>>;

    fn delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> BoxFuture<'_, Result<(), NatError>>;
}

pub type UpnpGateway = igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>;

/// Port mapping through the local router's IGD service.
pub struct UpnpMapper {
    gateway: UpnpGateway,
    local_ip: IpAddr,
}

impl UpnpMapper {
    /// Search the LAN for a gateway. `local_ip` is the address the gateway
    /// routes back to, found by pointing a UDP socket at it.
    pub async fn discover(timeout: Duration) -> Result<Self, NatError> {
        let options = igd_next::SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };
        let gateway = igd_next::aio::tokio::search_gateway(options).await?;

        let probe = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
        probe.connect(gateway.addr).await?;
        let local_ip = probe.local_addr()?.ip();

        tracing::info!(gateway = %gateway.addr, local = %local_ip, "UPnP gateway found");
        Ok(Self { gateway, local_ip })
    }
}

fn igd_protocol(protocol: Protocol) -> igd_next::PortMappingProtocol {
    match protocol {
        Protocol::Tcp => igd_next::PortMappingProtocol::TCP,
    }
}

impl PortMapper for UpnpMapper {
    fn add_port_mapping<'a>(
        &'a self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        description: &'a str,
        lease_secs: u32,
    ) -> BoxFuture<'a, Result<(), NatError>> {
        Box::pin(async move {
            self.gateway
                .add_port(
                    igd_protocol(protocol),
                    external_port,
                    SocketAddr::new(self.local_ip, internal_port),
                    lease_secs,
                    description,
                )
                .await?;
            Ok(())
        })
    }

    fn external_address(&self) -> BoxFuture<'_, Result<IpAddr, NatError>> {
        Box::pin(async move { Ok(self.gateway.get_external_ip().await?) })
    }

    fn delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> BoxFuture<'_, Result<(), NatError>> {
        Box::pin(async move {
            self.gateway
                .remove_port(igd_protocol(protocol), external_port)
                .await?;
            Ok(())
        })
    }
}

/// Keeps a TCP mapping for `port` alive.
///
/// First attempt is immediate, then one per `interval`. The external address
/// is queried after a successful renewal until one answer is recorded. A
/// failed renewal ends the loop; so does shutdown. Either way the mapping is
/// deleted on exit, best-effort.
pub struct LeaseRenewal {
    pub mapper: Arc<dyn PortMapper>,
    pub port: u16,
    pub lease_secs: u32,
    pub interval: Duration,
    pub external: Arc<OnceLock<IpAddr>>,
}

impl LeaseRenewal {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = if self.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.interval
        };
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("NAT renewal shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.renew().await {
                        tracing::warn!(port = self.port, error = %e, "NAT lease renewal failed, giving up");
                        break;
                    }
                }
            }
        }

        match self.mapper.delete_port_mapping(Protocol::Tcp, self.port).await {
            Ok(()) => tracing::debug!(port = self.port, "NAT mapping removed"),
            Err(e) => tracing::debug!(port = self.port, error = %e, "NAT mapping removal failed"),
        }
    }

    async fn renew(&self) -> Result<(), NatError> {
        self.mapper
            .add_port_mapping(
                Protocol::Tcp,
                self.port,
                self.port,
                MAPPING_DESCRIPTION,
                self.lease_secs,
            )
            .await?;
        tracing::debug!(port = self.port, lease = self.lease_secs, "NAT lease renewed");

        if self.external.get().is_none() {
            match self.mapper.external_address().await {
                Ok(ip) => {
                    tracing::info!(external = %SocketAddr::new(ip, self.port), "NAT mapping established");
                    let _ = self.external.set(ip);
                }
                Err(e) => tracing::debug!(error = %e, "external address unknown, will retry"),
            }
        }
        Ok(())
    }
}
