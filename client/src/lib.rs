//! Thread-safe, persistent peer address pool.
//!
//! The [`Pool`] owns an address manager and a local address registry, and keeps
//! the address manager saved to `peers.json` under its data directory while it
//! is running.
#![allow(clippy::new_without_default)]
#![deny(missing_docs, unsafe_code)]
mod error;
pub mod nodes;
pub mod peers;
pub mod pool;

pub use error::Error;
pub use pool::{Config, Pool, SNAPSHOT_INTERVAL};

pub use peerpool_common::dns;
pub use peerpool_p2p::local::{Priority, Reachability};
pub use peerpool_p2p::KnownAddress;

#[cfg(test)]
mod tests;
