//! Trusted-link client: blocking request/response against a co-located
//! companion node over one ordinary peer connection.
//!
//! Every request is "send one envelope, receive exactly one envelope". The
//! response receiver sits behind an async mutex that is held for the whole
//! exchange, so there is never more than one request in flight. A request
//! abandoned between send and reply leaves an unclaimed reply behind, so
//! cancellation breaks the link rather than let the next caller read it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use meridian_core::wire::TRUSTED_LINK_QUEUE;
use meridian_core::{Capabilities, Envelope, FrameError, Handshake, MessageType};

use crate::backend::{Backend, BackendError};
use crate::peer::{Direction, Inbox, Peer, SessionParams};

#[derive(Debug, thiserror::Error)]
pub enum TrustedLinkError {
    #[error("connect to companion failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("companion did not complete the handshake in time")]
    Timeout,
    #[error("companion rejected the handshake")]
    Rejected,
    #[error("send failed: {0}")]
    Send(#[from] FrameError),
    #[error("link closed while waiting for a response")]
    Closed,
    #[error("protocol violation: expected {expected:?}, got {got:?}")]
    ProtocolViolation {
        expected: MessageType,
        got: MessageType,
    },
    #[error("link is broken after an earlier failure")]
    Broken,
}

pub struct TrustedLink {
    peer: Arc<Peer>,
    responses: Mutex<mpsc::Receiver<Envelope>>,
    broken: AtomicBool,
}

impl TrustedLink {
    /// Dial `companion` (`host:port`) and wait for the handshake to finish.
    pub async fn connect(
        companion: &str,
        client_id: &str,
        timeout: Duration,
        ping_interval: Duration,
    ) -> Result<Self, TrustedLinkError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(companion))
            .await
            .map_err(|_| TrustedLinkError::Timeout)?
            .map_err(TrustedLinkError::Connect)?;
        let (peer, reader) = Peer::new(stream, Direction::Outbound).map_err(TrustedLinkError::Connect)?;

        let (tx, rx) = mpsc::channel(TRUSTED_LINK_QUEUE);
        // Only request/response traffic belongs in the reply queue.
        let caps = Capabilities {
            trusted_link: true,
            ..Default::default()
        };
        let params = SessionParams {
            hello: Handshake::new(client_id, caps, 0),
            ping_interval,
            write_timeout: timeout,
        };
        peer.spawn(reader, Inbox::Queue(tx), params);

        match tokio::time::timeout(timeout, peer.wait_active()).await {
            Ok(true) => {}
            Ok(false) => return Err(TrustedLinkError::Rejected),
            Err(_) => {
                peer.request_disconnect();
                return Err(TrustedLinkError::Timeout);
            }
        }
        tracing::info!(companion = %peer.remote(), "trusted link established");

        Ok(Self {
            peer,
            responses: Mutex::new(rx),
            broken: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Raw block for `hash`. `None` when the companion does not have it.
    pub async fn get_block(&self, hash: &[u8]) -> Result<Option<Bytes>, TrustedLinkError> {
        self.request(MessageType::GetBlock, hash, MessageType::BlockData)
            .await
    }

    /// Stored value for `key`. The reply is type-checked the same way as
    /// `get_block`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, TrustedLinkError> {
        self.request(MessageType::GetHash, key, MessageType::HashData)
            .await
    }

    async fn request(
        &self,
        kind: MessageType,
        key: &[u8],
        expected: MessageType,
    ) -> Result<Option<Bytes>, TrustedLinkError> {
        let mut responses = self.responses.lock().await;
        if self.is_broken() {
            return Err(TrustedLinkError::Broken);
        }
        let in_flight = InFlight::new(self);

        if let Err(e) = self
            .peer
            .send(&Envelope::single(kind, Bytes::copy_from_slice(key)))
            .await
        {
            return Err(e.into());
        }
        let Some(reply) = responses.recv().await else {
            return Err(TrustedLinkError::Closed);
        };
        if reply.kind != expected {
            tracing::warn!(?expected, got = ?reply.kind, "trusted link protocol violation");
            return Err(TrustedLinkError::ProtocolViolation {
                expected,
                got: reply.kind,
            });
        }
        in_flight.complete();
        Ok(reply.first().cloned())
    }

    fn break_link(&self) {
        self.broken.store(true, Ordering::Release);
        self.peer.request_disconnect();
    }
}

/// Armed for the span of one exchange. Unless completed, dropping it breaks
/// the link: on an error return, and when the caller's future is dropped
/// mid-request.
struct InFlight<'a> {
    link: &'a TrustedLink,
    completed: bool,
}

impl<'a> InFlight<'a> {
    fn new(link: &'a TrustedLink) -> Self {
        Self {
            link,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.link.break_link();
        }
    }
}

impl Drop for TrustedLink {
    fn drop(&mut self) {
        self.peer.request_disconnect();
    }
}

/// Read-only backend over the link. Writes stay local.
impl Backend for TrustedLink {
    fn get_block<'a>(&'a self, hash: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>> {
        Box::pin(async move { Ok(TrustedLink::get_block(self, hash).await?) })
    }

    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>> {
        Box::pin(async move { Ok(TrustedLink::get(self, key).await?) })
    }

    fn put<'a>(&'a self, _key: &'a [u8], _value: Bytes) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, _key: &'a [u8]) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async { Ok(()) })
    }
}
