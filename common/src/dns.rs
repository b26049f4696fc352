//! Host name resolution.
use log::debug;
use std::io;
use std::net::{self, ToSocketAddrs};
use std::sync::Arc;

/// A host resolver: maps a host name to its IP addresses.
pub type Lookup = Arc<dyn Fn(&str) -> io::Result<Vec<net::IpAddr>> + Send + Sync>;

/// Resolve a host name using the operating system's resolver.
pub fn lookup(host: &str) -> io::Result<Vec<net::IpAddr>> {
    let ips: Vec<_> = (host, 0).to_socket_addrs()?.map(|a| a.ip()).collect();

    debug!(target: "dns", "Resolved {} to {} address(es)", host, ips.len());

    Ok(ips)
}

/// The system resolver, as a [`Lookup`].
pub fn system() -> Lookup {
    Arc::new(lookup)
}

/// A resolver that never resolves anything. Useful when only IP literals are expected.
pub fn offline() -> Lookup {
    Arc::new(|host: &str| {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("name resolution is disabled, can't resolve `{}`", host),
        ))
    })
}
