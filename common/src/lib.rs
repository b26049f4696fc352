//! Types shared by all `peerpool` crates: network addresses and how they are
//! classified, wall-clock time, host resolution and file helpers.
#![warn(missing_docs)]
pub mod address;
pub mod dns;
pub mod io;
pub mod time;

#[cfg(any(test, feature = "quickcheck"))]
pub mod arbitrary;

pub use address::{AddrKey, NetAddr, ServiceFlags, SubnetworkId};
pub use time::{Clock, LocalDuration, LocalTime};
