//! Fan-out to registered peers and general-protocol dispatch.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use meridian_core::config::NetworkConfig;
use meridian_core::{Capabilities, Envelope, MessageType};
use meridian_net::{Dispatcher, MessageHandler, Peer, PeerState};

use crate::infra::*;

/// Forwards every transaction it sees to a channel.
struct TxSink(mpsc::UnboundedSender<Bytes>);

impl MessageHandler for TxSink {
    fn kinds(&self) -> &'static [MessageType] {
        &[MessageType::Tx]
    }

    fn handle<'a>(&'a self, _peer: &'a Peer, envelope: Envelope) -> BoxFuture<'a, Result<Option<Envelope>>> {
        Box::pin(async move {
            for item in envelope.payload {
                self.0.send(item)?;
            }
            Ok(None)
        })
    }
}

#[tokio::test]
async fn broadcast_reaches_every_active_peer() {
    let hub = start_server(network(4)).await;
    let hub_addr = loopback(&hub).to_string();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut leaves = Vec::new();
    for _ in 0..2 {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(TxSink(tx.clone())));
        let leaf = start_with_dispatcher(network(4), dispatcher).await;
        leaf.dial(&hub_addr).await.unwrap();
        leaves.push(leaf);
    }

    eventually("hub peers active", || async {
        let peers = hub.peers().await;
        peers.len() == 2 && peers.iter().all(|p| p.is_active())
    })
    .await;
    // The leaves must be Active too, or they drop the broadcast.
    for leaf in &leaves {
        eventually("leaf active", || async {
            leaf.peers().await.iter().all(|p| p.is_active())
        })
        .await;
    }

    let reached = hub
        .broadcast(MessageType::Tx, vec![Bytes::from_static(b"tx-1")])
        .await;
    assert_eq!(reached, 2);

    for _ in 0..2 {
        let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"tx-1"));
    }

    for leaf in &leaves {
        leaf.stop().await;
    }
    hub.stop().await;
}

#[tokio::test]
async fn unhandled_types_are_ignored() {
    let hub = start_server(network(4)).await;
    let (mut raw, mut framer) = raw_client(loopback(&hub)).await;
    next_envelope(&mut raw, &mut framer).await.unwrap();

    meridian_core::write_envelope(&mut raw, &Envelope::empty(MessageType::GetPeers))
        .await
        .unwrap();
    meridian_core::write_envelope(&mut raw, &Envelope::empty(MessageType::Ping))
        .await
        .unwrap();

    // No reply to GetPeers; the Ping still gets its Pong.
    let reply = next_envelope(&mut raw, &mut framer).await.unwrap();
    assert_eq!(reply.kind, MessageType::Pong);
    assert_eq!(hub.peer_count().await, 1);

    hub.stop().await;
}

#[tokio::test]
async fn stalled_peer_does_not_hold_up_broadcast() {
    let hub = start_server(NetworkConfig {
        dial_timeout_secs: 2,
        ..network(4)
    })
    .await;
    let hub_addr = loopback(&hub);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Arc::new(TxSink(tx)));
    let leaf = start_with_dispatcher(network(4), dispatcher).await;
    leaf.dial(&hub_addr.to_string()).await.unwrap();

    // Handshakes, then never reads again.
    let (stalled, _framer) = raw_client(hub_addr).await;
    let stalled_port = stalled.local_addr().unwrap().port();

    eventually("hub peers active", || async {
        let peers = hub.peers().await;
        peers.len() == 2 && peers.iter().all(|p| p.is_active())
    })
    .await;
    eventually("leaf active", || async {
        leaf.peers().await.iter().all(|p| p.is_active())
    })
    .await;

    let stalled_peer = hub
        .peers()
        .await
        .into_iter()
        .find(|p| p.remote().port() == stalled_port)
        .unwrap();

    // Keep sending until the stalled socket's buffers are full and its write
    // deadline fires. The healthy leaf must get every round regardless.
    let big = Bytes::from(vec![7u8; 8 << 20]);
    let fan_out = async {
        let mut rounds = 0;
        while rounds < 16 && !stalled_peer.is_disconnect_requested() {
            hub.broadcast(MessageType::Tx, vec![big.clone()]).await;
            rounds += 1;
        }
        rounds
    };
    let rounds = tokio::time::timeout(std::time::Duration::from_secs(30), fan_out)
        .await
        .expect("broadcast held up by a stalled peer");
    assert!(stalled_peer.is_disconnect_requested());

    for _ in 0..rounds {
        let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.len(), big.len());
    }

    eventually("stalled socket released", || async {
        stalled_peer.state() == PeerState::Closed
    })
    .await;

    drop(stalled);
    leaf.stop().await;
    hub.stop().await;
}

#[tokio::test]
async fn broadcast_skips_peers_without_the_capability() {
    let hub = start_server(network(4)).await;
    let link_only = Capabilities {
        trusted_link: true,
        ..Default::default()
    };
    let (mut raw, mut framer) = raw_client_with(loopback(&hub), link_only).await;
    assert_eq!(
        next_envelope(&mut raw, &mut framer).await.unwrap().kind,
        MessageType::Handshake
    );
    eventually("peer active", || async {
        hub.peers().await.iter().all(|p| p.is_active()) && hub.peer_count().await == 1
    })
    .await;

    let reached = hub
        .broadcast(MessageType::Tx, vec![Bytes::from_static(b"tx-1")])
        .await;
    assert_eq!(reached, 0);

    // Nothing was queued ahead of the Pong.
    meridian_core::write_envelope(&mut raw, &Envelope::empty(MessageType::Ping))
        .await
        .unwrap();
    assert_eq!(
        next_envelope(&mut raw, &mut framer).await.unwrap().kind,
        MessageType::Pong
    );

    hub.stop().await;
}
