//! General-protocol dispatch: routes envelopes from Active peers to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use meridian_core::{Envelope, MessageType};

use crate::peer::Peer;

/// Something that consumes envelopes of one or more message types.
///
/// Intentionally minimal: a handler may answer with one envelope, which is
/// written back to the same peer. Anything richer is built on top.
pub trait MessageHandler: Send + Sync {
    /// Message types this handler wants.
    fn kinds(&self) -> &'static [MessageType];

    /// Handle one envelope from `peer`.
    fn handle<'a>(
        &'a self,
        peer: &'a Peer,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<Option<Envelope>>>;
}

/// Maps message types to handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every type it reports. Later registrations win.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, handler.clone());
        }
    }

    /// Dispatch one envelope. Handler failures are logged, never propagated:
    /// a bad request from one peer must not end that peer's session.
    pub async fn dispatch(&self, peer: &Peer, envelope: Envelope) -> Option<Envelope> {
        let kind = envelope.kind;
        let Some(handler) = self.handlers.get(&kind) else {
            tracing::trace!(peer = %peer.remote(), ?kind, "no handler, dropping envelope");
            return None;
        };
        match handler.handle(peer, envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(peer = %peer.remote(), ?kind, error = %e, "handler failed");
                None
            }
        }
    }
}
