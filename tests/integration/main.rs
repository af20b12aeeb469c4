//! Meridian integration test harness.
//!
//! Every test runs real servers on loopback TCP with OS-assigned ports,
//! so tests can run in parallel without stepping on each other.
//!
//!   cargo test --test integration
//!
//! Name resolution is static (see `infra::StaticResolver`) and port mapping
//! is scripted (see `nat::RecordingMapper`); nothing here touches the public
//! DNS or a UPnP gateway.

mod broadcast;
mod dial;
mod nat;
mod trusted_link;
