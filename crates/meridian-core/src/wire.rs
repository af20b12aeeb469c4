//! Meridian wire format: the envelope every TCP connection carries.
//!
//! A frame is an 8-byte header (magic + body length) followed by the body:
//!
//! ```text
//! [magic: 4][body_len: u32 BE] [type: u8][item_count: u16 BE] ([item_len: u32 BE][item])*
//! ```
//!
//! The header is a packed zerocopy struct so it can be read straight out of
//! the receive buffer. Everything after it is parsed by `Envelope::from_frame`,
//! which also checks the payload shape against the message type.

use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every frame.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Must equal `MAGIC`. Anything else means the stream is out of sync.
    pub magic: [u8; 4],

    /// Body length in bytes, big-endian, not including this header.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(body_len: u32) -> Self {
        Self {
            magic: MAGIC,
            length: body_len.to_be_bytes(),
        }
    }

    pub fn body_len(&self) -> usize {
        u32::from_be_bytes(self.length) as usize
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Frame sync token.
pub const MAGIC: [u8; 4] = [0x22, 0x40, 0x08, 0x91];

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Upper bound on a frame body. A larger length prefix is treated as corruption.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Bytes requested from the socket per read.
pub const READ_BUFFER_SIZE: usize = 1440;

/// Handshake protocol version. Peers speaking another version are disconnected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for the peer-to-peer protocol.
pub const DEFAULT_PORT: u16 = 30303;

/// Default registry capacity.
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Inbound queue depth of a trusted-link peer.
pub const TRUSTED_LINK_QUEUE: usize = 5;

// ── Message Types ─────────────────────────────────────────────────────────────

/// Semantic kind of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x00,
    Disconnect = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    GetPeers = 0x10,
    Peers = 0x11,
    Tx = 0x12,
    Blocks = 0x13,
    /// Trusted link: request a raw block by hash.
    GetBlock = 0x20,
    /// Trusted link: response to `GetBlock`. Empty payload = not found.
    BlockData = 0x21,
    /// Trusted link: request a stored value by key.
    GetHash = 0x22,
    /// Trusted link: response to `GetHash`. Empty payload = not found.
    HashData = 0x23,
}

impl MessageType {
    /// Number of payload items this type may carry.
    pub fn arity(self) -> RangeInclusive<usize> {
        match self {
            MessageType::Handshake => 4..=4,
            MessageType::Disconnect => 0..=1,
            MessageType::Ping | MessageType::Pong | MessageType::GetPeers => 0..=0,
            MessageType::Peers | MessageType::Tx | MessageType::Blocks => 0..=usize::MAX,
            MessageType::GetBlock | MessageType::GetHash => 1..=1,
            MessageType::BlockData | MessageType::HashData => 0..=1,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Handshake),
            0x01 => Ok(MessageType::Disconnect),
            0x02 => Ok(MessageType::Ping),
            0x03 => Ok(MessageType::Pong),
            0x10 => Ok(MessageType::GetPeers),
            0x11 => Ok(MessageType::Peers),
            0x12 => Ok(MessageType::Tx),
            0x13 => Ok(MessageType::Blocks),
            0x20 => Ok(MessageType::GetBlock),
            0x21 => Ok(MessageType::BlockData),
            0x22 => Ok(MessageType::GetHash),
            0x23 => Ok(MessageType::HashData),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A frame whose boundaries are known but whose body has not been interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub body: Bytes,
}

/// The unit of transmission: a type tag and an ordered list of opaque items.
///
/// Trusted-link messages carry exactly one item (or none, for "absent").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageType,
    pub payload: Vec<Bytes>,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Vec<Bytes>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn single(kind: MessageType, item: impl Into<Bytes>) -> Self {
        Self::new(kind, vec![item.into()])
    }

    /// First payload item, if any.
    pub fn first(&self) -> Option<&Bytes> {
        self.payload.first()
    }

    /// Serialize the body (everything after the frame header).
    pub fn encode_body(&self) -> Result<Bytes, WireError> {
        let count = u16::try_from(self.payload.len())
            .map_err(|_| WireError::TooManyItems(self.payload.len()))?;
        let size = 3 + self.payload.iter().map(|i| 4 + i.len()).sum::<usize>();
        if size > MAX_BODY_LEN {
            return Err(WireError::BodyTooLarge(size));
        }

        let mut body = BytesMut::with_capacity(size);
        body.put_u8(self.kind.into());
        body.put_u16(count);
        for item in &self.payload {
            body.put_u32(item.len() as u32);
            body.put_slice(item);
        }
        Ok(body.freeze())
    }

    /// Interpret a frame body, validating the payload shape against the type.
    pub fn from_frame(frame: RawFrame) -> Result<Self, WireError> {
        let mut body = frame.body;
        if body.remaining() < 3 {
            return Err(WireError::Truncated);
        }
        let kind = MessageType::try_from(body.get_u8())?;
        let count = body.get_u16() as usize;

        let mut payload = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            if body.remaining() < 4 {
                return Err(WireError::Truncated);
            }
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(WireError::Truncated);
            }
            payload.push(body.split_to(len));
        }
        if body.has_remaining() {
            return Err(WireError::TrailingBytes(body.remaining()));
        }
        if !kind.arity().contains(&payload.len()) {
            return Err(WireError::UnexpectedArity {
                kind,
                items: payload.len(),
            });
        }

        Ok(Self { kind, payload })
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// What a node is willing to do for its peers, exchanged in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub peer_discovery: bool,
    pub tx_relay: bool,
    pub chain_relay: bool,
    /// Answers trusted-link GetBlock / GetHash requests.
    pub trusted_link: bool,
}

impl Capabilities {
    const PEER_DISCOVERY: u8 = 0x01;
    const TX_RELAY: u8 = 0x02;
    const CHAIN_RELAY: u8 = 0x04;
    const TRUSTED_LINK: u8 = 0x08;

    pub fn all() -> Self {
        Self {
            peer_discovery: true,
            tx_relay: true,
            chain_relay: true,
            trusted_link: true,
        }
    }

    /// Capabilities usable on a session: those both sides offer.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            peer_discovery: self.peer_discovery && other.peer_discovery,
            tx_relay: self.tx_relay && other.tx_relay,
            chain_relay: self.chain_relay && other.chain_relay,
            trusted_link: self.trusted_link && other.trusted_link,
        }
    }

    /// Does a session with these capabilities carry `kind`? Lifecycle
    /// messages always pass.
    pub fn covers(self, kind: MessageType) -> bool {
        match kind {
            MessageType::Handshake
            | MessageType::Disconnect
            | MessageType::Ping
            | MessageType::Pong => true,
            MessageType::GetPeers | MessageType::Peers => self.peer_discovery,
            MessageType::Tx => self.tx_relay,
            MessageType::Blocks => self.chain_relay,
            MessageType::GetBlock
            | MessageType::BlockData
            | MessageType::GetHash
            | MessageType::HashData => self.trusted_link,
        }
    }

    /// Unknown bits are ignored.
    pub fn from_byte(bits: u8) -> Self {
        Self {
            peer_discovery: bits & Self::PEER_DISCOVERY != 0,
            tx_relay: bits & Self::TX_RELAY != 0,
            chain_relay: bits & Self::CHAIN_RELAY != 0,
            trusted_link: bits & Self::TRUSTED_LINK != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut bits = 0;
        if self.peer_discovery {
            bits |= Self::PEER_DISCOVERY;
        }
        if self.tx_relay {
            bits |= Self::TX_RELAY;
        }
        if self.chain_relay {
            bits |= Self::CHAIN_RELAY;
        }
        if self.trusted_link {
            bits |= Self::TRUSTED_LINK;
        }
        bits
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Contents of the Handshake envelope each side sends first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub client_id: String,
    pub capabilities: Capabilities,
    /// Port the sender accepts connections on. 0 = not listening.
    pub listen_port: u16,
}

impl Handshake {
    pub fn new(client_id: impl Into<String>, capabilities: Capabilities, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_id: client_id.into(),
            capabilities,
            listen_port,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(
            MessageType::Handshake,
            vec![
                Bytes::copy_from_slice(&self.version.to_be_bytes()),
                Bytes::copy_from_slice(self.client_id.as_bytes()),
                Bytes::copy_from_slice(&[self.capabilities.to_byte()]),
                Bytes::copy_from_slice(&self.listen_port.to_be_bytes()),
            ],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, WireError> {
        if envelope.kind != MessageType::Handshake {
            return Err(WireError::MalformedHandshake);
        }
        let [version, client_id, caps, port] = envelope.payload.as_slice() else {
            return Err(WireError::MalformedHandshake);
        };

        let version: [u8; 4] = version
            .as_ref()
            .try_into()
            .map_err(|_| WireError::MalformedHandshake)?;
        let client_id =
            std::str::from_utf8(client_id).map_err(|_| WireError::MalformedHandshake)?;
        let [caps] = caps.as_ref() else {
            return Err(WireError::MalformedHandshake);
        };
        let port: [u8; 2] = port
            .as_ref()
            .try_into()
            .map_err(|_| WireError::MalformedHandshake)?;

        Ok(Self {
            version: u32::from_be_bytes(version),
            client_id: client_id.to_string(),
            capabilities: Capabilities::from_byte(*caps),
            listen_port: u16::from_be_bytes(port),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A frame arrived intact but its body is not a valid envelope.
///
/// These are recoverable: the frame boundary is known, so the envelope is
/// dropped and the connection keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("envelope body truncated")]
    Truncated,

    #[error("{0} trailing bytes after last payload item")]
    TrailingBytes(usize),

    #[error("{kind:?} does not accept {items} payload items")]
    UnexpectedArity { kind: MessageType, items: usize },

    #[error("payload has {0} items, at most 65535 allowed")]
    TooManyItems(usize),

    #[error("body length {0} exceeds maximum {}", MAX_BODY_LEN)]
    BodyTooLarge(usize),

    #[error("malformed handshake payload")]
    MalformedHandshake,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
