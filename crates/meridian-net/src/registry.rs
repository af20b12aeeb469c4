//! Peer registry: the set of live peers shared by every server task.
//!
//! Structural changes (insert, remove) go through one lock. Reap decisions
//! are made on a snapshot outside that lock, so a slow peer never holds up
//! admission; the removal itself re-takes the lock and works by id.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::peer::{Peer, PeerId};

/// Why a peer was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Registry already holds `max_peers` entries.
    Full,
    /// A peer on the same remote host is already registered.
    DuplicateHost,
}

pub struct PeerRegistry {
    max_peers: usize,
    peers: Mutex<BTreeMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_peers
    }

    /// Admit a peer if there is room. With `dedup_host`, also refuse a peer
    /// whose remote IP matches an existing entry.
    pub async fn try_insert(&self, peer: Arc<Peer>, dedup_host: bool) -> Result<(), Rejection> {
        let mut peers = self.peers.lock().await;
        if peers.len() >= self.max_peers {
            return Err(Rejection::Full);
        }
        let host = peer.remote().ip();
        if dedup_host && peers.values().any(|p| p.remote().ip() == host) {
            return Err(Rejection::DuplicateHost);
        }
        peers.insert(peer.id(), peer);
        Ok(())
    }

    pub async fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().await.remove(&id)
    }

    pub async fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().await.get(&id).cloned()
    }

    /// Is any registered peer connected to `host`?
    pub async fn contains_host(&self, host: IpAddr) -> bool {
        self.peers
            .lock()
            .await
            .values()
            .any(|p| p.remote().ip() == host)
    }

    /// Point-in-time copy of the registered peers, in admission order.
    pub async fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// Remove every peer that has asked to disconnect, and every inbound
    /// peer whose last Pong is older than `stale_after` at time `now`
    /// (Unix seconds). Evicted peers are told to release their sockets.
    pub async fn reap(&self, now: u64, stale_after: Duration) -> Vec<Arc<Peer>> {
        let doomed: Vec<PeerId> = self
            .snapshot()
            .await
            .iter()
            .filter(|p| p.should_reap(now, stale_after))
            .map(|p| p.id())
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }

        let evicted: Vec<Arc<Peer>> = {
            let mut peers = self.peers.lock().await;
            doomed.iter().filter_map(|id| peers.remove(id)).collect()
        };
        for peer in &evicted {
            peer.request_disconnect();
        }
        evicted
    }

    /// Empty the registry, closing every peer.
    pub async fn clear(&self) -> Vec<Arc<Peer>> {
        let drained: Vec<Arc<Peer>> = std::mem::take(&mut *self.peers.lock().await)
            .into_values()
            .collect();
        for peer in &drained {
            peer.request_disconnect();
        }
        drained
    }
}
