//! Address manager errors.

use peerpool_common::address;
use peerpool_common::NetAddr;

use thiserror::Error;

/// An error occuring in the address manager or one of its registries.
#[derive(Error, Debug)]
pub enum Error {
    /// A local address that peers couldn't reach.
    #[error("address {0} is not routable")]
    NotRoutable(NetAddr),

    /// A persisted document that couldn't be decoded.
    #[error("malformed document: {0}")]
    Parse(String),

    /// A persisted document whose contents don't match its checksum.
    #[error("document checksum mismatch")]
    Checksum,

    /// A persisted document written by an incompatible version.
    #[error("unsupported document version {found} (expected {expected})")]
    Version {
        /// Version found in the document.
        found: u64,
        /// Version this implementation reads.
        expected: u64,
    },

    /// A persisted document that decodes, but describes an inconsistent state.
    #[error("inconsistent state: {0}")]
    Invalid(String),
}

impl From<microserde::Error> for Error {
    fn from(err: microserde::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<address::Error> for Error {
    fn from(err: address::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
