//! Pool error module.
use std::io;

use thiserror::Error;

use peerpool_common::address;
use peerpool_p2p as p2p;

/// A pool error.
#[derive(Error, Debug)]
pub enum Error {
    /// An error coming from the address manager, eg. a malformed snapshot.
    #[error(transparent)]
    P2p(#[from] p2p::Error),
    /// An address that couldn't be parsed or resolved.
    #[error(transparent)]
    Address(#[from] address::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The snapshot task could not be started.
    #[error("error spawning snapshot task: {0}")]
    Spawn(io::Error),
}
