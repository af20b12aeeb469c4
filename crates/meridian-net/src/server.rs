//! The P2P server: listening socket, outbound dialing, reaping and NAT
//! lease renewal, all coordinated over one shared peer registry.
//!
//! Every long-running task watches the same broadcast shutdown channel.
//! Peer read loops are not part of that; they end when their peer is told
//! to disconnect.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::Instrument;

use meridian_core::config::{DiscoveryConfig, NetworkConfig};
use meridian_core::{Capabilities, Envelope, Handshake, MessageType};

use crate::discovery::{split_host_port, Discovery, Resolver, SystemResolver};
use crate::dispatch::Dispatcher;
use crate::nat::{LeaseRenewal, PortMapper};
use crate::peer::{unix_now, Direction, Inbox, Peer, PeerId, SessionParams};
use crate::registry::{PeerRegistry, Rejection};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),
    #[error("resolving {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("host resolved to no addresses")]
    NoAddresses,
    #[error("no usable address: host resolved only to IPv6")]
    NoUsableAddress,
    #[error("peer registry is full")]
    RegistryFull,
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Connected(PeerId),
    /// A peer on the same host is already registered. Nothing was dialed.
    AlreadyConnected,
}

/// Pick the address to dial from a resolution result.
///
/// One address is used as-is. With several, only IPv4 is eligible and one
/// is chosen at random; all-IPv6 answers are refused rather than silently
/// dialed.
pub fn select_address(ips: &[IpAddr], rng: &mut dyn RngCore) -> Result<IpAddr, DialError> {
    match ips {
        [] => Err(DialError::NoAddresses),
        [only] => Ok(*only),
        _ => {
            let v4: Vec<IpAddr> = ips.iter().copied().filter(IpAddr::is_ipv4).collect();
            v4.choose(rng).copied().ok_or(DialError::NoUsableAddress)
        }
    }
}

pub struct ServerBuilder {
    network: NetworkConfig,
    discovery: DiscoveryConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    resolver: Option<Arc<dyn Resolver>>,
    mapper: Option<Arc<dyn PortMapper>>,
    rng: Option<Box<dyn RngCore + Send>>,
    span: Option<tracing::Span>,
    capabilities: Capabilities,
}

impl ServerBuilder {
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            discovery: DiscoveryConfig::default(),
            dispatcher: None,
            resolver: None,
            mapper: None,
            rng: None,
            span: None,
            capabilities: Capabilities::all(),
        }
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Random source for address selection. Seed it for reproducible dials.
    pub fn rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Span every server task runs in.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn build(self) -> Server {
        let (shutdown, _) = broadcast::channel(1);
        let inner = Inner {
            registry: PeerRegistry::new(self.network.max_peers),
            discovery: Discovery::new(self.discovery),
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(Dispatcher::new())),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(SystemResolver::new())),
            mapper: self.mapper,
            rng: Mutex::new(
                self.rng
                    .unwrap_or_else(|| Box::new(StdRng::from_entropy())),
            ),
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("p2p")),
            capabilities: self.capabilities,
            network: self.network,
            shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            external_ip: Arc::new(OnceLock::new()),
        };
        Server {
            inner: Arc::new(inner),
        }
    }
}

/// Handle to a running (or not yet started) server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    network: NetworkConfig,
    registry: PeerRegistry,
    discovery: Discovery,
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<dyn Resolver>,
    mapper: Option<Arc<dyn PortMapper>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    span: tracing::Span,
    capabilities: Capabilities,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    listening: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    external_ip: Arc<OnceLock<IpAddr>>,
}

impl Server {
    pub fn builder(network: NetworkConfig) -> ServerBuilder {
        ServerBuilder::new(network)
    }

    /// Bind `port` and launch the accept loop, the reaper and, when a port
    /// mapper is configured, NAT renewal. A failed bind leaves the server
    /// running outbound-only. With `seed`, discovery runs once in the
    /// background.
    pub async fn start(&self, port: u16, seed: bool) {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        inner.start(port, seed).instrument(span).await
    }

    /// Register an accepted connection, or close it if the registry is full.
    pub async fn admit_inbound(&self, stream: TcpStream) {
        let span = self.inner.span.clone();
        self.inner.admit_inbound(stream).instrument(span).await
    }

    /// Connect to `address` (`host:port`) unless a peer on that host is
    /// already registered.
    pub async fn dial(&self, address: &str) -> Result<DialOutcome, DialError> {
        let span = self.inner.span.clone();
        self.inner.dial(address).instrument(span).await
    }

    /// One reap pass. Returns the evicted peers.
    pub async fn reap(&self) -> Vec<Arc<Peer>> {
        self.inner.reap().await
    }

    /// Dial every discovery candidate. Returns how many new peers connected.
    pub async fn seed(&self) -> usize {
        let span = self.inner.span.clone();
        self.inner.seed().instrument(span).await
    }

    /// Send one envelope to every Active peer whose negotiated capabilities
    /// cover `kind`. Writes run concurrently, each under the peer's write
    /// deadline; peers that fail are flagged for disconnection. Returns the
    /// number reached.
    pub async fn broadcast(&self, kind: MessageType, payload: Vec<Bytes>) -> usize {
        let envelope = Envelope::new(kind, payload);
        let targets: Vec<Arc<Peer>> = self
            .inner
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|p| p.is_active() && p.capabilities().covers(kind))
            .collect();

        let sends = targets.iter().map(|peer| {
            let envelope = &envelope;
            async move {
                match peer.send(envelope).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(parent: &self.inner.span, peer = %peer.remote(), error = %e, "broadcast send failed");
                        peer.request_disconnect();
                        false
                    }
                }
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }

    /// Remove a peer and close it now rather than on the next reap.
    pub async fn disconnect(&self, id: PeerId) -> bool {
        match self.inner.registry.remove(id).await {
            Some(peer) => {
                peer.request_disconnect();
                true
            }
            None => false,
        }
    }

    /// Signal every server task to stop and close all peers. A stopped
    /// server cannot be started again.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());
        self.inner.listening.store(false, Ordering::Release);
        let closed = self.inner.registry.clear().await;
        tracing::info!(parent: &self.inner.span, peers = closed.len(), "server stopped");
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.registry.snapshot().await
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Bound listening address, if the bind succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// External IP reported by the NAT gateway, once known.
    pub fn external_ip(&self) -> Option<IpAddr> {
        self.inner.external_ip.get().copied()
    }

    pub fn max_peers(&self) -> usize {
        self.inner.registry.max_peers()
    }
}

impl Inner {
    async fn start(self: Arc<Self>, port: u16, seed: bool) {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("server already started");
            return;
        }
        // Subscribe before checking `stopped`: a stop that lands after the
        // check is then still seen by every task.
        let accept_rx = self.shutdown.subscribe();
        let nat_rx = self.shutdown.subscribe();
        let reap_rx = self.shutdown.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            tracing::warn!("server was stopped before it started");
            return;
        }

        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    let _ = self.local_addr.set(addr);
                    tracing::info!(%addr, max_peers = self.network.max_peers, "listening");
                }
                self.listening.store(true, Ordering::Release);
                tokio::spawn(
                    self.clone()
                        .accept_loop(listener, accept_rx)
                        .instrument(self.span.clone()),
                );
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "bind failed, running outbound-only");
            }
        }

        if let Some(mapper) = &self.mapper {
            match self.local_addr.get() {
                Some(addr) => {
                    let renewal = LeaseRenewal {
                        mapper: mapper.clone(),
                        port: addr.port(),
                        lease_secs: self.network.nat_lease_secs,
                        interval: self.network.nat_renew_interval(),
                        external: self.external_ip.clone(),
                    };
                    tokio::spawn(
                        renewal
                            .run(nat_rx)
                            .instrument(self.span.clone()),
                    );
                }
                None => tracing::debug!("not listening, NAT mapping skipped"),
            }
        }

        tokio::spawn(
            self.clone()
                .reap_loop(reap_rx)
                .instrument(self.span.clone()),
        );

        if seed {
            let inner = self.clone();
            tokio::spawn(
                async move {
                    let connected = inner.seed().await;
                    tracing::info!(connected, "seeding finished");
                }
                .instrument(self.span.clone()),
            );
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("accept loop shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let inner = self.clone();
                            tokio::spawn(
                                async move { inner.admit_inbound(stream).await }
                                    .instrument(self.span.clone()),
                            );
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        self.listening.store(false, Ordering::Release);
    }

    async fn admit_inbound(&self, stream: TcpStream) {
        let (peer, reader) = match Peer::new(stream, Direction::Inbound) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "dropping inbound connection");
                return;
            }
        };
        if let Err(rejection) = self.registry.try_insert(peer.clone(), false).await {
            // Dropping the only handles to both halves closes the socket.
            tracing::debug!(peer = %peer.remote(), ?rejection, "inbound connection rejected");
            return;
        }
        tracing::debug!(peer = %peer.remote(), id = peer.id(), "inbound peer admitted");
        peer.spawn(reader, Inbox::Dispatch(self.dispatcher.clone()), self.session_params());
    }

    async fn dial(&self, address: &str) -> Result<DialOutcome, DialError> {
        if self.registry.is_full().await {
            return Err(DialError::RegistryFull);
        }
        let (host, port) =
            split_host_port(address).ok_or_else(|| DialError::InvalidAddress(address.to_string()))?;
        let ips = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?;

        for ip in &ips {
            if self.registry.contains_host(*ip).await {
                tracing::debug!(%address, "already connected to host");
                return Ok(DialOutcome::AlreadyConnected);
            }
        }

        let ip = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            select_address(&ips, &mut **rng)?
        };
        let target = SocketAddr::new(ip, port);

        let timeout = self.network.dial_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| DialError::Timeout(timeout))?
            .map_err(DialError::Connect)?;
        let (peer, reader) = Peer::new(stream, Direction::Outbound).map_err(DialError::Connect)?;

        match self.registry.try_insert(peer.clone(), true).await {
            Ok(()) => {}
            Err(Rejection::Full) => return Err(DialError::RegistryFull),
            Err(Rejection::DuplicateHost) => {
                tracing::debug!(%target, "lost race to an existing peer on this host");
                return Ok(DialOutcome::AlreadyConnected);
            }
        }
        tracing::debug!(%target, id = peer.id(), "outbound peer connected");
        peer.spawn(reader, Inbox::Dispatch(self.dispatcher.clone()), self.session_params());
        Ok(DialOutcome::Connected(peer.id()))
    }

    async fn reap(&self) -> Vec<Arc<Peer>> {
        let evicted = self
            .registry
            .reap(unix_now(), self.network.stale_after())
            .await;
        for peer in &evicted {
            tracing::debug!(parent: &self.span, peer = %peer.remote(), id = peer.id(), "reaped peer");
        }
        evicted
    }

    async fn reap_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.network.reap_interval().max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let evicted = self.reap().await;
                    if !evicted.is_empty() {
                        tracing::debug!(removed = evicted.len(), "reap pass");
                    }
                }
            }
        }
    }

    async fn seed(&self) -> usize {
        let candidates = self.discovery.candidates(self.resolver.as_ref()).await;
        tracing::info!(candidates = candidates.len(), "seeding from discovery");
        let mut connected = 0;
        for candidate in candidates {
            match self.dial(&candidate).await {
                Ok(DialOutcome::Connected(_)) => connected += 1,
                Ok(DialOutcome::AlreadyConnected) => {}
                Err(e) => tracing::debug!(%candidate, error = %e, "seed dial failed"),
            }
        }
        connected
    }

    fn session_params(&self) -> SessionParams {
        let listen_port = self.local_addr.get().map(|a| a.port()).unwrap_or(0);
        SessionParams {
            hello: Handshake::new(self.network.client_id.clone(), self.capabilities, listen_port),
            ping_interval: self.network.ping_interval(),
            write_timeout: self.network.dial_timeout(),
        }
    }
}
