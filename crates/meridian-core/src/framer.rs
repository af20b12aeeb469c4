//! Transport framer: moves envelopes over a byte stream.
//!
//! Reads are done `READ_BUFFER_SIZE` bytes at a time into an accumulation
//! buffer; a frame is only handed out once all of its bytes are present, so
//! envelopes larger than one read are reassembled transparently.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{
    Envelope, FrameHeader, RawFrame, WireError, HEADER_LEN, MAGIC, MAX_BODY_LEN, READ_BUFFER_SIZE,
};

/// The byte stream itself can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("frame length {0} exceeds maximum {}", MAX_BODY_LEN)]
    Oversized(usize),

    #[error("stream closed mid-frame ({0} bytes buffered)")]
    UnexpectedEof(usize),

    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] WireError),
}

/// Buffered decoder for one connection's inbound direction.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Serialize an envelope into one complete frame.
    pub fn encode(envelope: &Envelope) -> Result<Bytes, WireError> {
        let body = envelope.encode_body()?;
        let header = FrameHeader::new(body.len() as u32);
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Try to cut one frame off the front of `bytes`.
    ///
    /// `Ok(None)` means more data is needed; nothing was consumed. On success
    /// returns the frame and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<Option<(RawFrame, usize)>, FrameError> {
        let Some(header) = FrameHeader::read_from_prefix(bytes) else {
            return Ok(None);
        };
        if header.magic != MAGIC {
            return Err(FrameError::BadMagic(header.magic));
        }
        let body_len = header.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::Oversized(body_len));
        }
        let total = HEADER_LEN + body_len;
        if bytes.len() < total {
            return Ok(None);
        }
        let body = Bytes::copy_from_slice(&bytes[HEADER_LEN..total]);
        Ok(Some((RawFrame { body }, total)))
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame out of the accumulation buffer.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        match Self::decode(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read until one full frame is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial frame pending).
    /// Cancel safe: dropping the future never loses bytes already read.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<RawFrame>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::UnexpectedEof(self.buf.len()))
                };
            }
            self.extend(&chunk[..n]);
        }
    }
}

/// Write one envelope as a single frame.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = Framer::encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
