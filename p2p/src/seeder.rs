//! Node table of a DNS seeder.
//!
//! A seeder crawls the network and answers DNS queries with addresses of nodes
//! that recently accepted a connection. Unlike the address manager, it keeps a
//! flat table keyed by IP, with no buckets: every node it hears about is
//! eventually checked, and nodes that are no longer advertised are pruned.
use std::collections::HashMap;
use std::net;

use log::*;
use microserde::json::{Array, Number, Object, Value};

use peerpool_common::address;
use peerpool_common::time::{Clock, LocalDuration, LocalTime};
use peerpool_common::{NetAddr, ServiceFlags, SubnetworkId};

use crate::error::Error;
use crate::json::{as_array, as_object, as_str, as_u64, field, time_from_json, time_to_json};

/// Maximum number of addresses returned by a query.
pub const MAX_ADDRESSES: usize = 16;
/// Nodes that haven't accepted a connection this recently are not handed out.
pub const DEFAULT_STALE_TIMEOUT: LocalDuration = LocalDuration::from_hours(1);
/// Nodes attempted this recently are not checked again.
pub const RECHECK_TIMEOUT: LocalDuration = LocalDuration::from_hours(2);
/// Nodes not advertised for this long are forgotten.
pub const PRUNE_EXPIRE_TIMEOUT: LocalDuration = LocalDuration::from_hours(8);
/// How often nodes should be pruned.
pub const PRUNE_INTERVAL: LocalDuration = LocalDuration::from_mins(1);
/// Version of the persisted node table.
pub const SERIAL_VERSION: u64 = 1;

/// DNS record type of a query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordType {
    /// IPv4 host address.
    A,
    /// IPv6 host address.
    Aaaa,
    /// Any other record type, by number.
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(other: u16) -> Self {
        match other {
            1 => Self::A,
            28 => Self::Aaaa,
            n => Self::Other(n),
        }
    }
}

/// A node known to the seeder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node address, including the services it offers.
    pub addr: NetAddr,
    /// Last time we tried to connect.
    pub last_attempt: Option<LocalTime>,
    /// Last time a connection succeeded.
    pub last_success: Option<LocalTime>,
    /// Last time a peer advertised this node.
    pub last_seen: LocalTime,
    /// Subnetwork the node serves, `None` for full nodes.
    pub subnetwork: Option<SubnetworkId>,
}

/// Table of nodes known to a seeder.
#[derive(Debug)]
pub struct Seeder<C> {
    nodes: HashMap<net::IpAddr, Node>,
    default_port: u16,
    clock: C,
}

impl<C: Clock> Seeder<C> {
    /// Create an empty table. Only nodes listening on `default_port` are handed out
    /// in query answers, since DNS can't carry a port.
    pub fn new(default_port: u16, clock: C) -> Self {
        Self {
            nodes: HashMap::new(),
            default_port,
            clock,
        }
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    pub fn get(&self, ip: &net::IpAddr) -> Option<&Node> {
        self.nodes.get(ip)
    }

    /// Add advertised addresses. Known nodes are marked as seen.
    ///
    /// Returns the number of new nodes.
    pub fn add_addresses(&mut self, addrs: impl IntoIterator<Item = NetAddr>) -> usize {
        let now = self.clock.local_time();
        let mut count = 0;

        for addr in addrs {
            if !addr.is_routable() {
                continue;
            }
            let ip = addr.ip_addr();

            if let Some(node) = self.nodes.get_mut(&ip) {
                node.last_seen = now;
                continue;
            }
            self.nodes.insert(
                ip,
                Node {
                    addr,
                    last_attempt: None,
                    last_success: None,
                    last_seen: now,
                    subnetwork: None,
                },
            );
            count += 1;
        }
        if count > 0 {
            debug!(target: "seeder", "Added {} new node(s), {} known", count, self.nodes.len());
        }
        count
    }

    /// Called when we try to connect to a node.
    pub fn attempt(&mut self, addr: &NetAddr) {
        let now = self.clock.local_time();

        if let Some(node) = self.nodes.get_mut(&addr.ip_addr()) {
            node.last_attempt = Some(now);
        }
    }

    /// Called when a node accepted our connection and told us what it serves.
    pub fn good(&mut self, addr: &NetAddr, services: ServiceFlags, subnetwork: Option<SubnetworkId>) {
        let now = self.clock.local_time();

        if let Some(node) = self.nodes.get_mut(&addr.ip_addr()) {
            trace!(target: "seeder", "Node {} is good ({})", addr, services);

            node.addr.services = services;
            node.last_success = Some(now);
            node.subnetwork = subnetwork;
        }
    }

    /// Addresses to answer a DNS query with: nodes on the default port that
    /// match the record type, subnetwork and services, and that accepted a
    /// connection recently.
    pub fn good_for_query(
        &self,
        record: RecordType,
        services: ServiceFlags,
        include_all_subnetworks: bool,
        subnetwork: Option<&SubnetworkId>,
    ) -> Vec<NetAddr> {
        let now = self.clock.local_time();
        let ipv4 = match record {
            RecordType::A => true,
            RecordType::Aaaa => false,
            RecordType::Other(_) => return Vec::new(),
        };

        self.nodes
            .values()
            .filter(|n| n.addr.port == self.default_port)
            .filter(|n| include_all_subnetworks || n.subnetwork.as_ref() == subnetwork)
            .filter(|n| n.addr.is_ipv4() == ipv4)
            .filter(|n| n.addr.services.has(services))
            .filter(|n| {
                n.last_success
                    .map_or(false, |t| now - t <= DEFAULT_STALE_TIMEOUT)
            })
            .take(MAX_ADDRESSES)
            .map(|n| n.addr.clone())
            .collect()
    }

    /// Nodes due for a connection check: neither succeeded nor attempted recently.
    pub fn addresses_to_recheck(&self) -> Vec<NetAddr> {
        let now = self.clock.local_time();

        self.nodes
            .values()
            .filter(|n| n.last_success.map_or(true, |t| now - t >= DEFAULT_STALE_TIMEOUT))
            .filter(|n| n.last_attempt.map_or(true, |t| now - t >= RECHECK_TIMEOUT))
            .take(MAX_ADDRESSES)
            .map(|n| n.addr.clone())
            .collect()
    }

    /// Forget nodes that nobody advertised in a while.
    ///
    /// Returns the number of nodes removed.
    pub fn prune(&mut self) -> usize {
        let now = self.clock.local_time();
        let before = self.nodes.len();

        self.nodes
            .retain(|_, n| now - n.last_seen <= PRUNE_EXPIRE_TIMEOUT);

        let pruned = before - self.nodes.len();
        if pruned > 0 {
            info!(target: "seeder", "Pruned {} node(s), {} left", pruned, self.nodes.len());
        }
        pruned
    }

    /// Encode the node table as a JSON document.
    pub fn to_json(&self) -> Value {
        let nodes: Array = self.nodes.values().map(node_to_json).collect();
        let mut obj = Object::new();

        obj.insert("version".to_owned(), Value::Number(Number::U64(SERIAL_VERSION)));
        obj.insert("nodes".to_owned(), Value::Array(nodes));

        Value::Object(obj)
    }

    /// Replace the node table with the one described by a JSON document.
    pub fn restore(&mut self, value: &Value) -> Result<(), Error> {
        let obj = as_object(value, "document")?;
        let version = as_u64(field(obj, "version")?, "version")?;

        if version != SERIAL_VERSION {
            return Err(Error::Version {
                found: version,
                expected: SERIAL_VERSION,
            });
        }
        let mut nodes = HashMap::new();

        for v in as_array(field(obj, "nodes")?, "nodes")?.iter() {
            let node = node_from_json(v)?;
            nodes.insert(node.addr.ip_addr(), node);
        }
        self.nodes = nodes;

        Ok(())
    }
}

fn node_to_json(node: &Node) -> Value {
    let mut obj = Object::new();
    let subnetwork = node
        .subnetwork
        .as_ref()
        .map_or_else(String::new, |id| id.to_string());

    obj.insert("addr".to_owned(), Value::String(node.addr.key().as_str().to_owned()));
    obj.insert(
        "services".to_owned(),
        Value::Number(Number::U64(node.addr.services.as_u64())),
    );
    obj.insert("timestamp".to_owned(), time_to_json(Some(node.addr.timestamp)));
    obj.insert("last_attempt".to_owned(), time_to_json(node.last_attempt));
    obj.insert("last_success".to_owned(), time_to_json(node.last_success));
    obj.insert("last_seen".to_owned(), time_to_json(Some(node.last_seen)));
    obj.insert("subnetwork".to_owned(), Value::String(subnetwork));

    Value::Object(obj)
}

fn node_from_json(v: &Value) -> Result<Node, Error> {
    let obj = as_object(v, "node")?;
    let services = ServiceFlags::from(as_u64(field(obj, "services")?, "services")?);
    let timestamp = time_from_json(field(obj, "timestamp")?, "timestamp")?.unwrap_or_default();
    let addr = address::from_key(as_str(field(obj, "addr")?, "addr")?, services, timestamp)?;
    let subnetwork = match as_str(field(obj, "subnetwork")?, "subnetwork")? {
        "" => None,
        id => Some(id.parse::<SubnetworkId>()?),
    };

    Ok(Node {
        addr,
        last_attempt: time_from_json(field(obj, "last_attempt")?, "last_attempt")?,
        last_success: time_from_json(field(obj, "last_success")?, "last_success")?,
        last_seen: time_from_json(field(obj, "last_seen")?, "last_seen")?.unwrap_or_default(),
        subnetwork,
    })
}
