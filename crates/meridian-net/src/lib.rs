//! meridian-net: peers, the peer registry and server, discovery, NAT
//! lease renewal and the trusted-link client.

pub mod backend;
pub mod discovery;
pub mod dispatch;
pub mod nat;
pub mod peer;
pub mod registry;
pub mod server;
pub mod trusted;

#[cfg(test)]
mod test_util;

pub use backend::{Backend, BackendError, BackendService, MemoryBackend};
pub use discovery::{Discovery, Resolver, SystemResolver};
pub use dispatch::{Dispatcher, MessageHandler};
pub use nat::{NatError, PortMapper, Protocol, UpnpMapper};
pub use peer::{Direction, Peer, PeerId, PeerState};
pub use registry::{PeerRegistry, Rejection};
pub use server::{select_address, DialError, DialOutcome, Server, ServerBuilder};
pub use trusted::{TrustedLink, TrustedLinkError};
