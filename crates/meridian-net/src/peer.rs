//! One live connection to a remote node.
//!
//! A `Peer` owns the write half of its socket; the read half belongs to the
//! peer's read loop, which runs as its own task. Liveness timestamps and the
//! disconnect flag are atomics so the reaper can inspect a peer without
//! waiting on it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use meridian_core::wire::PROTOCOL_VERSION;
use meridian_core::{
    write_envelope, Capabilities, Envelope, FrameError, Framer, Handshake, MessageType,
};

use crate::dispatch::Dispatcher;

/// Registry-unique peer identifier. Never reused within a process.
pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Smallest ping period the read loop accepts.
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Write deadline until `spawn` installs the session's own.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Disconnecting,
    Closed,
}

impl PeerState {
    /// Has the handshake phase been left behind, one way or the other?
    fn is_settled(self) -> bool {
        !matches!(self, PeerState::Connecting | PeerState::Handshaking)
    }
}

/// Destination for envelopes that are not handshake or liveness traffic.
#[derive(Clone)]
pub enum Inbox {
    /// Bounded queue drained by a blocking caller. A full queue stalls the
    /// read loop until the caller catches up.
    Queue(mpsc::Sender<Envelope>),
    /// General-protocol handlers.
    Dispatch(Arc<Dispatcher>),
}

/// What the read loop needs to know about our side of the session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub hello: Handshake,
    pub ping_interval: Duration,
    /// A write that cannot finish within this is abandoned and the peer is
    /// told to disconnect.
    pub write_timeout: Duration,
}

pub struct Peer {
    id: PeerId,
    remote: SocketAddr,
    direction: Direction,
    state: watch::Sender<PeerState>,
    disconnect: AtomicBool,
    last_send: AtomicU64,
    last_pong: AtomicU64,
    capabilities: AtomicU8,
    remote_hello: OnceLock<Handshake>,
    write_timeout_ms: AtomicU64,
    writer: Mutex<OwnedWriteHalf>,
    shutdown: Notify,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// Wrap a freshly connected socket. The peer starts in `Connecting`; the
    /// returned read half must be handed to `spawn` to bring it up.
    pub fn new(stream: TcpStream, direction: Direction) -> std::io::Result<(Arc<Self>, OwnedReadHalf)> {
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let now = unix_now();
        let peer = Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            direction,
            state: watch::Sender::new(PeerState::Connecting),
            disconnect: AtomicBool::new(false),
            last_send: AtomicU64::new(now),
            last_pong: AtomicU64::new(now),
            capabilities: AtomicU8::new(0),
            remote_hello: OnceLock::new(),
            write_timeout_ms: AtomicU64::new(DEFAULT_WRITE_TIMEOUT.as_millis() as u64),
            writer: Mutex::new(writer),
            shutdown: Notify::new(),
        });
        Ok((peer, reader))
    }

    /// Start the read loop on its own task, inside the caller's span.
    pub fn spawn(
        self: &Arc<Self>,
        reader: OwnedReadHalf,
        inbox: Inbox,
        params: SessionParams,
    ) -> JoinHandle<()> {
        self.write_timeout_ms
            .store(params.write_timeout.as_millis() as u64, Ordering::Relaxed);
        let span = tracing::debug_span!("peer", id = self.id, remote = %self.remote);
        tokio::spawn(self.clone().run(reader, inbox, params).instrument(span))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    /// Wait for the handshake to resolve. True if the peer became Active,
    /// false if it went down first.
    pub async fn wait_active(&self) -> bool {
        let mut states = self.state.subscribe();
        states
            .wait_for(|s| s.is_settled())
            .await
            .map(|s| *s == PeerState::Active)
            .unwrap_or(false)
    }

    /// Has any task asked for this peer to be torn down?
    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Unix seconds of the last successful write.
    pub fn last_send(&self) -> u64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// Unix seconds of the last Pong (or handshake) received.
    pub fn last_pong(&self) -> u64 {
        self.last_pong.load(Ordering::Relaxed)
    }

    /// Capabilities negotiated in the handshake. Empty until Active.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_byte(self.capabilities.load(Ordering::Relaxed))
    }

    /// The handshake the remote sent, once received.
    pub fn remote_handshake(&self) -> Option<&Handshake> {
        self.remote_hello.get()
    }

    /// Set the disconnect flag and stop the read loop, which releases the
    /// socket. Registry removal is left to the reaper.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// Should the reaper evict this peer?
    ///
    /// Outbound peers are never reaped for silence, only for the flag.
    pub fn should_reap(&self, now: u64, stale_after: Duration) -> bool {
        self.is_disconnect_requested()
            || (self.is_inbound() && now.saturating_sub(self.last_pong()) > stale_after.as_secs())
    }

    /// Write one envelope. Concurrent senders are serialized on the writer.
    ///
    /// The wait for the writer and the write itself share one deadline. On
    /// expiry the frame may be half-written, so the peer is torn down.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), FrameError> {
        if self.state() == PeerState::Closed || self.is_disconnect_requested() {
            return Err(FrameError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        let deadline = Duration::from_millis(self.write_timeout_ms.load(Ordering::Relaxed));
        let write = async {
            let mut writer = self.writer.lock().await;
            write_envelope(&mut *writer, envelope).await
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(written) => written?,
            Err(_) => {
                tracing::debug!(peer = %self.remote, ?deadline, "write timed out, dropping peer");
                self.request_disconnect();
                return Err(FrameError::Io(std::io::ErrorKind::TimedOut.into()));
            }
        }
        self.last_send.store(unix_now(), Ordering::Relaxed);
        Ok(())
    }

    fn set_state(&self, next: PeerState) {
        self.state.send_if_modified(|current| {
            if *current == PeerState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn touch_pong(&self) {
        self.last_pong.store(unix_now(), Ordering::Relaxed);
    }

    async fn run(self: Arc<Self>, mut reader: OwnedReadHalf, inbox: Inbox, params: SessionParams) {
        let local_caps = params.hello.capabilities;
        self.set_state(PeerState::Handshaking);

        if let Err(e) = self.send(&params.hello.to_envelope()).await {
            tracing::debug!(error = %e, "failed to send handshake");
            self.release(reader).await;
            return;
        }

        let period = params.ping_interval.max(MIN_PING_INTERVAL);
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut framer = Framer::new();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("disconnect requested");
                    break;
                }

                _ = ping.tick() => {
                    if let Err(e) = self.send(&Envelope::empty(MessageType::Ping)).await {
                        tracing::debug!(error = %e, "ping failed");
                        break;
                    }
                }

                frame = framer.read_frame(&mut reader) => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            tracing::debug!("connection closed by remote");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "read failed, dropping peer");
                            break;
                        }
                    };
                    let envelope = match Envelope::from_frame(frame) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping malformed envelope");
                            continue;
                        }
                    };
                    if !self.handle(envelope, &inbox, local_caps).await {
                        break;
                    }
                }
            }
        }

        self.release(reader).await;
    }

    /// Returns false when the session should end.
    async fn handle(&self, envelope: Envelope, inbox: &Inbox, local_caps: Capabilities) -> bool {
        match envelope.kind {
            MessageType::Handshake => {
                if self.state() != PeerState::Handshaking {
                    return true;
                }
                match Handshake::from_envelope(&envelope) {
                    Ok(hello) if hello.version != PROTOCOL_VERSION => {
                        tracing::warn!(
                            version = hello.version,
                            client = %hello.client_id,
                            "incompatible protocol version"
                        );
                        let _ = self.send(&Envelope::empty(MessageType::Disconnect)).await;
                        false
                    }
                    Ok(hello) => {
                        let caps = local_caps.intersect(hello.capabilities);
                        self.capabilities.store(caps.to_byte(), Ordering::Relaxed);
                        self.touch_pong();
                        tracing::debug!(
                            client = %hello.client_id,
                            listen_port = hello.listen_port,
                            caps = caps.to_byte(),
                            "handshake complete"
                        );
                        let _ = self.remote_hello.set(hello);
                        self.set_state(PeerState::Active);
                        true
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed handshake");
                        true
                    }
                }
            }
            MessageType::Ping => self.send(&Envelope::empty(MessageType::Pong)).await.is_ok(),
            MessageType::Pong => {
                self.touch_pong();
                true
            }
            MessageType::Disconnect => {
                tracing::debug!("remote sent disconnect");
                false
            }
            kind if self.state() != PeerState::Active => {
                tracing::debug!(?kind, "envelope before handshake, dropping");
                true
            }
            _ => match inbox {
                Inbox::Queue(queue) => queue.send(envelope).await.is_ok(),
                Inbox::Dispatch(dispatcher) => match dispatcher.dispatch(self, envelope).await {
                    Some(reply) => self.send(&reply).await.is_ok(),
                    None => true,
                },
            },
        }
    }

    async fn release(&self, reader: OwnedReadHalf) {
        self.disconnect.store(true, Ordering::Release);
        self.set_state(PeerState::Disconnecting);
        drop(reader);
        let _ = self.writer.lock().await.shutdown().await;
        self.set_state(PeerState::Closed);
    }
}
