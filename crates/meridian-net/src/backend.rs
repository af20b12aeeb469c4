//! Storage backend contract and the handler that serves it to companions.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;

use meridian_core::{Envelope, MessageType};

use crate::dispatch::MessageHandler;
use crate::peer::Peer;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Link(#[from] crate::trusted::TrustedLinkError),
}

/// Key/value and block access the network layer needs from the chain.
/// Values are opaque; `None` means absent.
pub trait Backend: Send + Sync {
    fn get_block<'a>(&'a self, hash: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>>;

    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>>;

    fn put<'a>(&'a self, key: &'a [u8], value: Bytes) -> BoxFuture<'a, Result<(), BackendError>>;

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), BackendError>>;
}

/// In-process backend. Blocks and plain values share one keyspace
/// under distinct prefixes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<Vec<u8>, Bytes>,
}

const BLOCK_PREFIX: u8 = b'b';
const VALUE_PREFIX: u8 = b'v';

fn prefixed(prefix: u8, key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 1);
    k.push(prefix);
    k.extend_from_slice(key);
    k
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_block(&self, hash: &[u8], block: impl Into<Bytes>) {
        self.entries.insert(prefixed(BLOCK_PREFIX, hash), block.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Backend for MemoryBackend {
    fn get_block<'a>(&'a self, hash: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>> {
        Box::pin(async move {
            Ok(self
                .entries
                .get(&prefixed(BLOCK_PREFIX, hash))
                .map(|v| v.value().clone()))
        })
    }

    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>, BackendError>> {
        Box::pin(async move {
            Ok(self
                .entries
                .get(&prefixed(VALUE_PREFIX, key))
                .map(|v| v.value().clone()))
        })
    }

    fn put<'a>(&'a self, key: &'a [u8], value: Bytes) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            self.entries.insert(prefixed(VALUE_PREFIX, key), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            self.entries.remove(&prefixed(VALUE_PREFIX, key));
            Ok(())
        })
    }
}

/// Answers GetBlock and GetHash from a backend, which lets this node act as
/// the companion end of a trusted link.
pub struct BackendService {
    backend: Arc<dyn Backend>,
}

impl BackendService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

impl MessageHandler for BackendService {
    fn kinds(&self) -> &'static [MessageType] {
        &[MessageType::GetBlock, MessageType::GetHash]
    }

    fn handle<'a>(
        &'a self,
        peer: &'a Peer,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<Option<Envelope>>> {
        Box::pin(async move {
            let key = envelope.first().cloned().unwrap_or_default();
            let (found, reply_kind) = match envelope.kind {
                MessageType::GetBlock => (self.backend.get_block(&key).await?, MessageType::BlockData),
                MessageType::GetHash => (self.backend.get(&key).await?, MessageType::HashData),
                other => anyhow::bail!("unexpected {other:?}"),
            };
            tracing::trace!(
                peer = %peer.remote(),
                key = %hex::encode(&key),
                found = found.is_some(),
                "served backend lookup"
            );
            Ok(Some(match found {
                Some(value) => Envelope::single(reply_kind, value),
                None => Envelope::empty(reply_kind),
            }))
        })
    }
}
