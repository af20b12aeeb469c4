//! Trusted link against a real companion server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;

use meridian_core::{Envelope, MessageType};
use meridian_net::{
    Backend, BackendService, Dispatcher, MemoryBackend, MessageHandler, Peer, Server, TrustedLink,
    TrustedLinkError,
};

use crate::infra::*;

async fn companion(backend: Arc<MemoryBackend>) -> Server {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Arc::new(BackendService::new(backend)));
    start_with_dispatcher(network(4), dispatcher).await
}

async fn connect(server: &Server) -> TrustedLink {
    TrustedLink::connect(
        &loopback(server).to_string(),
        "integration-link",
        WAIT,
        Duration::from_secs(30),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn fetches_blocks_and_values_from_companion() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_block(b"\x01\x02", &b"genesis"[..]);
    backend
        .put(b"state-root", Bytes::from_static(b"\xaa\xbb"))
        .await
        .unwrap();
    let server = companion(backend.clone()).await;
    let link = connect(&server).await;

    assert_eq!(
        link.get_block(b"\x01\x02").await.unwrap(),
        Some(Bytes::from_static(b"genesis"))
    );
    assert_eq!(link.get_block(b"\x09").await.unwrap(), None);
    assert_eq!(
        link.get(b"state-root").await.unwrap(),
        Some(Bytes::from_static(b"\xaa\xbb"))
    );
    assert_eq!(link.get(b"missing").await.unwrap(), None);

    // Writes through the link never reach the companion.
    let as_backend: &dyn Backend = &link;
    as_backend
        .put(b"local-only", Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(backend.get(b"local-only").await.unwrap(), None);

    let peer = server.peers().await.pop().unwrap();
    assert!(peer.capabilities().trusted_link);
    assert!(!peer.capabilities().chain_relay);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_callers_get_their_own_answers() {
    let backend = Arc::new(MemoryBackend::new());
    for i in 0u8..16 {
        backend.insert_block(&[i], vec![i; 4]);
    }
    let server = companion(backend).await;
    let link = Arc::new(connect(&server).await);

    let calls = (0u8..16).map(|i| {
        let link = link.clone();
        async move { (i, link.get_block(&[i]).await.unwrap()) }
    });
    for (i, block) in futures::future::join_all(calls).await {
        assert_eq!(block, Some(Bytes::from(vec![i; 4])));
    }

    server.stop().await;
}

/// Companion that answers block requests with a transaction.
struct Misbehaving;

impl MessageHandler for Misbehaving {
    fn kinds(&self) -> &'static [MessageType] {
        &[MessageType::GetBlock]
    }

    fn handle<'a>(&'a self, _peer: &'a Peer, _envelope: Envelope) -> BoxFuture<'a, Result<Option<Envelope>>> {
        Box::pin(async { Ok(Some(Envelope::single(MessageType::Tx, &b"not a block"[..]))) })
    }
}

#[tokio::test]
async fn wrong_response_type_is_a_protocol_violation() {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Arc::new(Misbehaving));
    let server = start_with_dispatcher(network(4), dispatcher).await;
    let link = connect(&server).await;

    let err = link.get_block(b"\x01").await.unwrap_err();
    assert!(
        matches!(
            err,
            TrustedLinkError::ProtocolViolation {
                expected: MessageType::BlockData,
                got: MessageType::Tx,
            }
        ),
        "got {err}"
    );
    assert!(link.is_broken());
    assert!(matches!(
        link.get_block(b"\x01").await,
        Err(TrustedLinkError::Broken)
    ));

    // The companion drops its side once the link hangs up.
    eventually("companion peer flagged", || async {
        server
            .peers()
            .await
            .iter()
            .all(|p| p.is_disconnect_requested())
    })
    .await;
    assert_eq!(server.reap().await.len(), 1);

    server.stop().await;
}
