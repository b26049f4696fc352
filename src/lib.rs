//! Peerpool is a bucketed, persistent address manager for gossip networks.
//!
//! The project is broken down into the following crates:
//!
//! * [`client`]: the thread-safe pool, with its background snapshot task
//! * [`p2p`]: the address manager, local address registry and seeder table
//! * [`common`]: address, time and resolver types used by all crates
//!
//! The [`client`] crate is intended to be the entry point for most users of the
//! library.

#[cfg(feature = "peerpool-client")]
pub use peerpool_client as client;
#[cfg(feature = "peerpool-common")]
pub use peerpool_common as common;
#[cfg(feature = "peerpool-p2p")]
pub use peerpool_p2p as p2p;

pub mod logger;
