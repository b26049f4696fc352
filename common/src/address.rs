//! Peer network addresses.
//!
//! Every address is held as a 16-byte IP: IPv4 addresses are IPv4-mapped and
//! Tor (v2) onion addresses are stored "onion-cat" style, behind a fixed
//! 6-byte prefix. This module derives the two identities the address manager
//! works with: the canonical textual [`AddrKey`], and the routing *group*
//! that approximates the network block an address belongs to.
use std::fmt;
use std::io;
use std::net;
use std::str::FromStr;

use bitcoin_hashes::hex::{FromHex, ToHex};
use thiserror::Error;

use crate::time::LocalTime;

/// Prefix of onion-cat encoded Tor addresses, `fd87:d87e:eb43::/48`.
pub const ONION_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];
/// Length of a Tor (v2) onion name, without the `.onion` suffix.
pub const ONION_NAME_LEN: usize = 16;

/// Group of addresses that are local to this host.
pub const GROUP_LOCAL: &[u8] = b"local";
/// Group of addresses in private address space.
pub const GROUP_PRIVATE: &[u8] = b"private";

/// Base32 alphabet used by onion addresses (RFC 4648, lowercase).
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// An address parsing or resolution error.
#[derive(Error, Debug)]
pub enum Error {
    /// The string is not of the form `host:port`.
    #[error("invalid address `{0}`: expected `host:port`")]
    InvalidAddress(String),
    /// The port could not be parsed.
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    /// An `.onion` host that doesn't decode to an onion-cat address.
    #[error("invalid onion address `{0}`")]
    InvalidOnion(String),
    /// A subnetwork identifier that isn't 20 hex-encoded bytes.
    #[error("invalid subnetwork id `{0}`")]
    InvalidSubnetwork(String),
    /// The resolver failed.
    #[error("failed to resolve `{host}`: {err}")]
    Lookup {
        /// Host that was looked up.
        host: String,
        /// Underlying error.
        err: io::Error,
    },
    /// The resolver returned nothing.
    #[error("no addresses found for `{0}`")]
    NoAddresses(String),
}

/// Services advertised by a peer, as a bitset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// The peer serves the full chain.
    pub const NETWORK: ServiceFlags = ServiceFlags(1);

    /// Whether all the bits in `other` are set.
    pub fn has(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn add(&mut self, other: ServiceFlags) {
        self.0 |= other.0;
    }

    /// Raw bits.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ServiceFlags {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a subnetwork partition. Nodes that aren't full nodes belong to one.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetworkId([u8; SubnetworkId::LEN]);

impl SubnetworkId {
    /// Length of an identifier, in bytes.
    pub const LEN: usize = 20;

    /// Create an identifier from raw bytes.
    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0[..].to_hex())
    }
}

impl fmt::Debug for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubnetworkId({})", self)
    }
}

impl FromStr for SubnetworkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            Vec::<u8>::from_hex(s).map_err(|_| Error::InvalidSubnetwork(s.to_owned()))?;
        let bytes: [u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSubnetwork(s.to_owned()))?;

        Ok(Self(bytes))
    }
}

/// Canonical textual form of an address: `ip:port`, `[ip]:port` or `name.onion:port`.
///
/// This is the primary key of the address manager, and the payload hashed to
/// find an address's *tried* bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrKey(String);

impl AddrKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&NetAddr> for AddrKey {
    fn from(addr: &NetAddr) -> Self {
        addr.key()
    }
}

impl std::borrow::Borrow<str> for AddrKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A network address, as advertised by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    /// IP address. IPv4 addresses are IPv4-mapped.
    pub ip: net::Ipv6Addr,
    /// Port.
    pub port: u16,
    /// Advertised services.
    pub services: ServiceFlags,
    /// Last time this address was advertised as active.
    pub timestamp: LocalTime,
}

impl NetAddr {
    /// Create a new network address.
    pub fn new(ip: net::IpAddr, port: u16, services: ServiceFlags, timestamp: LocalTime) -> Self {
        let ip = match ip {
            net::IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            net::IpAddr::V6(ip) => ip,
        };
        Self {
            ip,
            port,
            services,
            timestamp,
        }
    }

    /// Create a network address from a socket address.
    pub fn from_socket_addr(
        addr: &net::SocketAddr,
        services: ServiceFlags,
        timestamp: LocalTime,
    ) -> Self {
        Self::new(addr.ip(), addr.port(), services, timestamp)
    }

    /// Create an onion-cat address from the 10 bytes of a Tor (v2) onion name.
    pub fn onion(name: [u8; 10], port: u16, services: ServiceFlags, timestamp: LocalTime) -> Self {
        let mut octets = [0; 16];
        octets[..6].copy_from_slice(&ONION_PREFIX);
        octets[6..].copy_from_slice(&name);

        Self {
            ip: net::Ipv6Addr::from(octets),
            port,
            services,
            timestamp,
        }
    }

    /// Return a copy of this address with a different timestamp.
    pub fn with_timestamp(&self, timestamp: LocalTime) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// The IP address, un-mapped if it is an IPv4 address.
    pub fn ip_addr(&self) -> net::IpAddr {
        match self.ipv4() {
            Some(ip) => net::IpAddr::V4(ip),
            None => net::IpAddr::V6(self.ip),
        }
    }

    /// The socket address.
    pub fn socket_addr(&self) -> net::SocketAddr {
        net::SocketAddr::new(self.ip_addr(), self.port)
    }

    /// The IPv4 address, if this is an IPv4-mapped address.
    pub fn ipv4(&self) -> Option<net::Ipv4Addr> {
        if self.is_ipv4() {
            let o = self.octets();
            Some(net::Ipv4Addr::new(o[12], o[13], o[14], o[15]))
        } else {
            None
        }
    }

    /// Canonical key of this address.
    pub fn key(&self) -> AddrKey {
        let host = if self.is_onion() {
            format!("{}.onion", base32_encode(&self.octets()[6..]))
        } else if let Some(ip) = self.ipv4() {
            ip.to_string()
        } else {
            format!("[{}]", self.ip)
        };
        AddrKey(format!("{}:{}", host, self.port))
    }

    /// Routing group of this address. Addresses in the same group are assumed to be
    /// controlled by the same network operator.
    pub fn group(&self) -> Vec<u8> {
        let o = self.octets();

        if self.is_local() {
            return GROUP_LOCAL.to_vec();
        }
        if self.is_rfc1918() || (self.is_rfc4193() && !self.is_onion()) {
            return GROUP_PRIVATE.to_vec();
        }
        if !self.is_routable() {
            return GROUP_LOCAL.to_vec();
        }
        if self.is_ipv4() || self.is_rfc6145() || self.is_rfc6052() {
            return o[12..14].to_vec();
        }
        if self.is_rfc3964() {
            return o[2..4].to_vec();
        }
        if self.is_rfc4380() {
            // Teredo embeds the client's IPv4 address with all bits flipped.
            return vec![o[12] ^ 0xff, o[13] ^ 0xff];
        }
        if self.is_onion() {
            return o[6..10].to_vec();
        }
        if self.is_he_tunnel() {
            return o[..6].to_vec();
        }
        o[..4].to_vec()
    }

    /// Whether this address can be reached from the public internet.
    pub fn is_routable(&self) -> bool {
        self.is_valid()
            && !(self.is_rfc1918()
                || self.is_rfc2544()
                || self.is_rfc3927()
                || self.is_rfc4862()
                || self.is_rfc3849()
                || self.is_rfc4843()
                || self.is_rfc5737()
                || self.is_rfc6598()
                || self.is_local()
                || self.is_multicast()
                || (self.is_rfc4193() && !self.is_onion()))
    }

    /// Neither unspecified nor the IPv4 broadcast address.
    pub fn is_valid(&self) -> bool {
        !(self.ip.is_unspecified() || self.ipv4() == Some(net::Ipv4Addr::BROADCAST))
    }

    /// Loopback, unspecified, or in `0.0.0.0/8`.
    pub fn is_local(&self) -> bool {
        match self.ipv4() {
            Some(ip) => ip.is_loopback() || ip.octets()[0] == 0,
            None => self.ip.is_loopback() || self.ip.is_unspecified(),
        }
    }

    /// IPv4-mapped address (`::ffff:0:0/96`).
    pub fn is_ipv4(&self) -> bool {
        let o = self.octets();
        o[..10].iter().all(|b| *b == 0) && o[10] == 0xff && o[11] == 0xff
    }

    /// Onion-cat encoded Tor address.
    pub fn is_onion(&self) -> bool {
        self.octets()[..6] == ONION_PREFIX
    }

    /// Multicast, `224.0.0.0/4` or `ff00::/8`.
    pub fn is_multicast(&self) -> bool {
        match self.ipv4() {
            Some(ip) => ip.is_multicast(),
            None => self.ip.is_multicast(),
        }
    }

    /// Private IPv4 space: `10.0.0.0/8`, `172.16.0.0/12` and `192.168.0.0/16`.
    pub fn is_rfc1918(&self) -> bool {
        self.ipv4().map_or(false, |ip| ip.is_private())
    }

    /// Benchmarking, `198.18.0.0/15`.
    pub fn is_rfc2544(&self) -> bool {
        self.v4_in([198, 18, 0, 0], 15)
    }

    /// IPv6 documentation, `2001:db8::/32`.
    pub fn is_rfc3849(&self) -> bool {
        self.v6_in(&[0x20, 0x01, 0x0d, 0xb8], 32)
    }

    /// IPv4 link-local, `169.254.0.0/16`.
    pub fn is_rfc3927(&self) -> bool {
        self.v4_in([169, 254, 0, 0], 16)
    }

    /// 6to4 tunnelling, `2002::/16`.
    pub fn is_rfc3964(&self) -> bool {
        self.v6_in(&[0x20, 0x02], 16)
    }

    /// Unique local addresses, `fc00::/7`.
    pub fn is_rfc4193(&self) -> bool {
        self.v6_in(&[0xfc], 7)
    }

    /// Teredo tunnelling, `2001::/32`.
    pub fn is_rfc4380(&self) -> bool {
        self.v6_in(&[0x20, 0x01, 0x00, 0x00], 32)
    }

    /// ORCHID, `2001:10::/28`.
    pub fn is_rfc4843(&self) -> bool {
        self.v6_in(&[0x20, 0x01, 0x00, 0x10], 28)
    }

    /// IPv6 link-local, `fe80::/64`.
    pub fn is_rfc4862(&self) -> bool {
        self.v6_in(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0], 64)
    }

    /// IPv4 documentation: `192.0.2.0/24`, `198.51.100.0/24` and `203.0.113.0/24`.
    pub fn is_rfc5737(&self) -> bool {
        self.v4_in([192, 0, 2, 0], 24)
            || self.v4_in([198, 51, 100, 0], 24)
            || self.v4_in([203, 0, 113, 0], 24)
    }

    /// Well-known NAT64 prefix, `64:ff9b::/96`.
    pub fn is_rfc6052(&self) -> bool {
        self.v6_in(&[0, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0], 96)
    }

    /// IPv4-translated addresses, `::ffff:0:0:0/96`.
    pub fn is_rfc6145(&self) -> bool {
        self.v6_in(&[0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0, 0], 96)
    }

    /// Shared address space, `100.64.0.0/10`.
    pub fn is_rfc6598(&self) -> bool {
        self.v4_in([100, 64, 0, 0], 10)
    }

    /// Hurricane Electric tunnel broker, `2001:470::/32`.
    pub fn is_he_tunnel(&self) -> bool {
        self.v6_in(&[0x20, 0x01, 0x04, 0x70], 32)
    }

    /// Legacy 6bone test network, `3ffe::/16`.
    pub fn is_6bone(&self) -> bool {
        self.v6_in(&[0x3f, 0xfe], 16)
    }

    fn octets(&self) -> [u8; 16] {
        self.ip.octets()
    }

    fn v4_in(&self, net: [u8; 4], bits: u32) -> bool {
        match self.ipv4() {
            Some(ip) => {
                let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
                u32::from(ip) & mask == u32::from_be_bytes(net) & mask
            }
            None => false,
        }
    }

    fn v6_in(&self, prefix: &[u8], bits: usize) -> bool {
        if self.is_ipv4() {
            return false;
        }
        let octets = self.octets();
        let (whole, rest) = (bits / 8, bits % 8);

        if octets[..whole] != prefix[..whole] {
            return false;
        }
        if rest > 0 {
            let mask = 0xffu8 << (8 - rest);
            return octets[whole] & mask == prefix[whole] & mask;
        }
        true
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Split a `host:port` string. IPv6 hosts must be bracketed.
pub fn split_host_port(s: &str) -> Result<(&str, u16), Error> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        rest.split_once("]:")
            .ok_or_else(|| Error::InvalidAddress(s.to_owned()))?
    } else {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_owned()))?;
        if host.contains(':') {
            return Err(Error::InvalidAddress(s.to_owned()));
        }
        (host, port)
    };
    if host.is_empty() {
        return Err(Error::InvalidAddress(s.to_owned()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidPort(port.to_owned()))?;

    Ok((host, port))
}

/// Turn a host into a network address.
///
/// Onion names are decoded into onion-cat addresses, IP literals are parsed,
/// and anything else goes through `lookup`, keeping the first result.
pub fn host_to_net_addr(
    host: &str,
    port: u16,
    services: ServiceFlags,
    timestamp: LocalTime,
    lookup: &dyn Fn(&str) -> io::Result<Vec<net::IpAddr>>,
) -> Result<NetAddr, Error> {
    if let Some(name) = host.strip_suffix(".onion") {
        if name.len() != ONION_NAME_LEN {
            return Err(Error::InvalidOnion(host.to_owned()));
        }
        let bytes = base32_decode(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidOnion(host.to_owned()))?;
        let name: [u8; 10] = bytes
            .try_into()
            .map_err(|_| Error::InvalidOnion(host.to_owned()))?;

        return Ok(NetAddr::onion(name, port, services, timestamp));
    }
    if let Ok(ip) = host.parse::<net::IpAddr>() {
        return Ok(NetAddr::new(ip, port, services, timestamp));
    }
    let ips = lookup(host).map_err(|err| Error::Lookup {
        host: host.to_owned(),
        err,
    })?;
    let ip = ips
        .first()
        .ok_or_else(|| Error::NoAddresses(host.to_owned()))?;

    Ok(NetAddr::new(*ip, port, services, timestamp))
}

/// Parse an address key back into a network address, without name resolution.
pub fn from_key(key: &str, services: ServiceFlags, timestamp: LocalTime) -> Result<NetAddr, Error> {
    let (host, port) = split_host_port(key)?;

    host_to_net_addr(
        host,
        port,
        services,
        timestamp,
        &|_: &str| -> io::Result<Vec<net::IpAddr>> { Err(io::ErrorKind::Unsupported.into()) },
    )
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for byte in data {
        buffer = (buffer << 8) | *byte as u32;
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in s.bytes() {
        let value = BASE32_ALPHABET.iter().position(|a| *a == c)? as u32;

        buffer = (buffer << 5) | value;
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}
