//! meridiand: Meridian peer-to-peer node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use meridian_core::config::MeridianConfig;
use meridian_net::{
    BackendService, Dispatcher, MemoryBackend, PortMapper, Server, TrustedLink, UpnpMapper,
};

const UPNP_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeridianConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeridianConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeridianConfig::default()
    });
    tracing::info!(
        client = %config.network.client_id,
        port = config.network.port,
        max_peers = config.network.max_peers,
        nat = config.network.nat,
        seed = config.network.seed,
        "meridiand starting"
    );

    // Companion serving: answer GetBlock / GetHash from the local store.
    let backend = Arc::new(MemoryBackend::new());
    let dispatcher = {
        let mut d = Dispatcher::new();
        d.register(Arc::new(BackendService::new(backend.clone())));
        Arc::new(d)
    };

    let mut builder = Server::builder(config.network.clone())
        .discovery(config.discovery.clone())
        .dispatcher(dispatcher);
    if config.network.nat {
        match UpnpMapper::discover(UPNP_SEARCH_TIMEOUT).await {
            Ok(mapper) => builder = builder.port_mapper(Arc::new(mapper) as Arc<dyn PortMapper>),
            Err(e) => tracing::warn!(error = %e, "UPnP unavailable, continuing without NAT mapping"),
        }
    }
    let server = builder.build();
    server.start(config.network.port, config.network.seed).await;

    // Trusted link to a co-located companion, if configured.
    let _link = match &config.trusted_link.companion {
        Some(companion) => match TrustedLink::connect(
            companion,
            &config.network.client_id,
            config.network.dial_timeout(),
            config.network.ping_interval(),
        )
        .await
        {
            Ok(link) => Some(link),
            Err(e) => {
                tracing::warn!(%companion, error = %e, "trusted link unavailable");
                None
            }
        },
        None => None,
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let peer_printer = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let peers = server.peers().await;
                tracing::info!(
                    count = peers.len(),
                    listening = server.is_listening(),
                    external = ?server.external_ip(),
                    "peer table snapshot"
                );
                for p in &peers {
                    tracing::info!(
                        id = p.id(),
                        peer = %p.remote(),
                        direction = ?p.direction(),
                        state = ?p.state(),
                        client = p.remote_handshake().map(|h| h.client_id.as_str()).unwrap_or("-"),
                        "  peer"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = peer_printer       => tracing::error!("peer printer exited: {:?}", r),
    }

    server.stop().await;
    tracing::info!(stored = backend.len(), "meridiand stopped");
    Ok(())
}
