//! meridian-core: wire format, transport framing and configuration.
//! All other Meridian crates depend on this one.

pub mod config;
pub mod framer;
pub mod wire;

pub use framer::{write_envelope, FrameError, Framer};
pub use wire::{Capabilities, Envelope, Handshake, MessageType, WireError};
