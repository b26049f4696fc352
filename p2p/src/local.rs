//! Our own addresses, and which of them to advertise to a given peer.
use std::collections::BTreeMap;
use std::fmt;
use std::net;

use log::*;

use peerpool_common::{AddrKey, LocalTime, NetAddr, ServiceFlags};

use crate::error::Error;

/// How a local address was discovered. Later variants are more trustworthy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Found on a network interface.
    Interface = 0,
    /// An address we're listening on.
    Bound = 1,
    /// Mapped through UPnP.
    Upnp = 2,
    /// Reported by an external HTTP service.
    Http = 3,
    /// Configured by the user.
    Manual = 4,
}

impl Priority {
    /// The score of a freshly registered address of this priority.
    pub fn score(self) -> u32 {
        self as u32
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interface" => Ok(Self::Interface),
            "bound" => Ok(Self::Bound),
            "upnp" => Ok(Self::Upnp),
            "http" => Ok(Self::Http),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("unknown address priority `{}`", s)),
        }
    }
}

/// How well a remote peer can reach one of our addresses. Higher is better.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reachability {
    /// Can't be reached.
    Unreachable = 0,
    /// Might be reachable, nothing better is known.
    Default = 1,
    /// Both ends are Teredo tunnels.
    Teredo = 2,
    /// IPv6, with our end tunnelled.
    Ipv6Weak = 3,
    /// IPv4.
    Ipv4 = 4,
    /// Native IPv6.
    Ipv6Strong = 5,
    /// Both ends are on the same private network, eg. Tor.
    Private = 6,
}

impl Reachability {
    /// How well `remote` can reach `local`.
    pub fn between(local: &NetAddr, remote: &NetAddr) -> Self {
        if !remote.is_routable() {
            return Self::Unreachable;
        }
        if remote.is_onion() {
            if local.is_onion() {
                return Self::Private;
            }
            if local.is_routable() && local.is_ipv4() {
                return Self::Ipv4;
            }
            return Self::Default;
        }
        if remote.is_rfc4380() {
            if !local.is_routable() {
                return Self::Default;
            }
            if local.is_rfc4380() {
                return Self::Teredo;
            }
            if local.is_ipv4() {
                return Self::Ipv4;
            }
            return Self::Ipv6Weak;
        }
        if remote.is_ipv4() {
            if local.is_routable() && local.is_ipv4() {
                return Self::Ipv4;
            }
            return Self::Unreachable;
        }

        // Remote is IPv6.
        if !local.is_routable() {
            return Self::Default;
        }
        if local.is_rfc4380() {
            return Self::Teredo;
        }
        if local.is_ipv4() {
            return Self::Ipv4;
        }
        let tunnelled =
            local.is_rfc3964() || local.is_6bone() || local.is_rfc6052() || local.is_rfc6145();
        if tunnelled {
            return Self::Ipv6Weak;
        }
        Self::Ipv6Strong
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A local address, and how much we trust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    /// The address.
    pub addr: NetAddr,
    /// Trust score. Starts at the priority it was registered with.
    pub score: u32,
}

/// Registry of our own addresses.
#[derive(Debug, Default)]
pub struct LocalAddresses {
    addrs: BTreeMap<AddrKey, LocalAddress>,
}

impl LocalAddresses {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether no addresses are registered.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Whether the address is one of ours.
    pub fn contains(&self, addr: &NetAddr) -> bool {
        self.addrs.contains_key(&addr.key())
    }

    /// Iterate over registered addresses.
    pub fn iter(&self) -> impl Iterator<Item = &LocalAddress> + '_ {
        self.addrs.values()
    }

    /// Register one of our addresses. Registering an address again with a higher
    /// priority than its current score bumps the score above that priority.
    pub fn register(&mut self, addr: NetAddr, priority: Priority) -> Result<(), Error> {
        if !addr.is_routable() {
            return Err(Error::NotRoutable(addr));
        }
        let key = addr.key();

        match self.addrs.get_mut(&key) {
            Some(local) => {
                if local.score < priority.score() {
                    local.score = priority.score() + 1;
                }
            }
            None => {
                info!(target: "addrmgr", "Registered local address {} ({:?})", key, priority);

                self.addrs.insert(
                    key,
                    LocalAddress {
                        addr,
                        score: priority.score(),
                    },
                );
            }
        }
        Ok(())
    }

    /// The local address to advertise to `remote`: the most reachable one, and among
    /// those the most trusted. If none of our addresses is reachable, the unspecified
    /// address is returned.
    pub fn best_for(&self, remote: &NetAddr) -> NetAddr {
        let mut best: Option<(Reachability, u32, &NetAddr)> = None;

        for local in self.addrs.values() {
            let reach = Reachability::between(&local.addr, remote);

            if reach == Reachability::Unreachable {
                continue;
            }
            let better = match best {
                None => true,
                Some((r, score, _)) => reach > r || (reach == r && local.score > score),
            };
            if better {
                best = Some((reach, local.score, &local.addr));
            }
        }

        match best {
            Some((reach, _, addr)) => {
                debug!(
                    target: "addrmgr",
                    "Suggesting address {} for {} (reachability: {})", addr, remote, reach
                );
                addr.clone()
            }
            None => {
                debug!(target: "addrmgr", "No worthy address for {}", remote);

                let ip = if remote.is_ipv4() || remote.is_onion() {
                    net::IpAddr::from(net::Ipv4Addr::UNSPECIFIED)
                } else {
                    net::IpAddr::from(net::Ipv6Addr::UNSPECIFIED)
                };
                NetAddr::new(ip, 0, ServiceFlags::NETWORK, LocalTime::default())
            }
        }
    }
}
