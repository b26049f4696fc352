//! Peerpool's address management library.
//!
//! The `p2p` crate implements the state kept about other peers, free of any I/O:
//!
//! * [`AddressManager`][addrmgr]: bucketed table of peer addresses, and the selection of
//!   addresses to dial
//! * [`LocalAddresses`][local]: our own addresses, and which to advertise to whom
//! * [`Seeder`][seeder]: flat node table of a DNS seeder
//!
//! [addrmgr]: crate::addrmgr::AddressManager
//! [local]: crate::local::LocalAddresses
//! [seeder]: crate::seeder::Seeder
//!
//! Time is read through a [`Clock`](peerpool_common::Clock), so that the
//! behavior of every component is deterministic under test. Reading and writing
//! the persisted forms to disk is left to the caller.
//!
#![allow(clippy::new_without_default)]
#![deny(missing_docs, unsafe_code)]
pub mod addrmgr;
pub mod error;
pub mod local;
pub mod seeder;

mod json;

pub use addrmgr::{AddressManager, KnownAddress};
pub use error::Error;
pub use local::{LocalAddresses, Priority, Reachability};
pub use seeder::Seeder;
