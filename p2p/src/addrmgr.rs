//!
//! The peer address manager.
//!
//! Addresses learned through gossip go into *new* buckets. Once we manage to
//! complete a handshake with a peer, its address moves to a *tried* bucket.
//! Bucket placement is keyed by a secret, so that no single source can flood
//! the table, and selection is biased against addresses that failed or were
//! attempted recently.
//!
#![warn(missing_docs)]
use std::collections::{HashMap, HashSet};

use log::*;

use peerpool_common::time::{Clock, LocalDuration};
use peerpool_common::{AddrKey, NetAddr, SubnetworkId};

pub mod bucket;
pub mod known;
pub mod snapshot;


use bucket::{Partition, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_SIZE, TRIED_BUCKET_SIZE};
pub use known::KnownAddress;

/// How long after an address was last advertised a successful connection refreshes it.
pub const CONNECTED_REFRESH: LocalDuration = LocalDuration::from_mins(20);
/// Below this many addresses, we should ask peers for more.
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;
/// Minimum number of addresses handed out by [`AddressManager::snapshot_candidates`].
pub const GET_ADDR_MIN: usize = 50;
/// Maximum number of addresses handed out by [`AddressManager::snapshot_candidates`].
pub const GET_ADDR_MAX: usize = 2500;
/// Percentage of known addresses handed out by [`AddressManager::snapshot_candidates`].
pub const GET_ADDR_PERCENT: usize = 23;

/// Address manager configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Subnetwork served by the local node, `None` for a full node.
    pub local_subnetwork: Option<SubnetworkId>,
}

/// Manages peer network addresses.
#[derive(Debug)]
pub struct AddressManager<C> {
    /// Secret key used for bucket placement.
    secret: [u8; 32],
    /// All known addresses. Buckets refer to these by key.
    index: HashMap<AddrKey, KnownAddress>,
    /// Buckets, per subnetwork. Full nodes are under `None`.
    partitions: HashMap<Option<SubnetworkId>, Partition>,
    /// Addresses handed out for dialing, and not yet reported on.
    in_flight: HashSet<AddrKey>,
    cfg: Config,
    rng: fastrand::Rng,
    clock: C,
}

impl<C: Clock> AddressManager<C> {
    /// Create a new, empty address manager.
    pub fn new(cfg: Config, secret: [u8; 32], clock: C) -> Self {
        Self {
            secret,
            index: HashMap::new(),
            partitions: HashMap::new(),
            in_flight: HashSet::new(),
            cfg,
            rng: rng(&secret),
            clock,
        }
    }

    /// Generate a fresh secret from the operating system's random source.
    pub fn generate_secret() -> [u8; 32] {
        rand::random()
    }

    /// Forget every address, and start over with a new secret.
    pub fn reset(&mut self, secret: [u8; 32]) {
        self.secret = secret;
        self.rng = rng(&secret);
        self.index.clear();
        self.partitions.clear();
        self.in_flight.clear();
    }

    /// The secret used for bucket placement.
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// The subnetwork served by the local node.
    pub fn local_subnetwork(&self) -> Option<&SubnetworkId> {
        self.cfg.local_subnetwork.as_ref()
    }

    /// The number of addresses known.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether there are any addresses known to the address manager.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a known address.
    pub fn get(&self, addr: &NetAddr) -> Option<&KnownAddress> {
        self.index.get(&addr.key())
    }

    /// Iterate over all known addresses.
    pub fn iter(&self) -> impl Iterator<Item = &KnownAddress> + '_ {
        self.index.values()
    }

    /// Whether the address was handed out by [`AddressManager::select_one`] and not yet
    /// reported on.
    pub fn is_in_flight(&self, addr: &NetAddr) -> bool {
        self.in_flight.contains(&addr.key())
    }

    /// Number of addresses in the *new* buckets of a subnetwork.
    pub fn new_count(&self, subnetwork: Option<&SubnetworkId>) -> usize {
        self.partition(subnetwork).map_or(0, |p| p.n_new)
    }

    /// Number of addresses in the *tried* buckets of a subnetwork.
    pub fn tried_count(&self, subnetwork: Option<&SubnetworkId>) -> usize {
        self.partition(subnetwork).map_or(0, |p| p.n_tried)
    }

    /// Number of addresses known for a subnetwork.
    pub fn num_addresses(&self, subnetwork: Option<&SubnetworkId>) -> usize {
        self.partition(subnetwork).map_or(0, |p| p.len())
    }

    /// Whether we know few enough addresses that we should ask peers for more.
    pub fn need_more(&self) -> bool {
        let local = self.cfg.local_subnetwork.as_ref();
        let mut count = self.num_addresses(local);

        // Full nodes can always be connected to.
        if local.is_some() {
            count += self.num_addresses(None);
        }
        count < NEED_ADDRESS_THRESHOLD
    }

    /// Add an address heard about from `source` to the address manager.
    ///
    /// Returns `true` if the address was placed in a new bucket.
    pub fn observe(
        &mut self,
        addr: NetAddr,
        source: &NetAddr,
        subnetwork: Option<SubnetworkId>,
    ) -> bool {
        if !addr.is_routable() {
            trace!(target: "addrmgr", "Ignoring non-routable address {}", addr);
            return false;
        }
        let key = addr.key();

        let partition = match self.index.get_mut(&key) {
            Some(ka) => {
                // Keep the most recent advertisement, and everything the peer ever
                // claimed to serve.
                if addr.timestamp > ka.addr.timestamp || !ka.addr.services.has(addr.services) {
                    let mut updated = ka.addr.with_timestamp(ka.addr.timestamp.max(addr.timestamp));
                    updated.services.add(addr.services);
                    ka.addr = updated;
                }
                if ka.tried {
                    return false;
                }
                if ka.refs >= NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }
                // The more buckets an address is already in, the less likely
                // it is to be added to another one.
                let factor = 2 * ka.refs as u32;
                if factor > 0 && self.rng.u32(..factor) != 0 {
                    return false;
                }
                ka.subnetwork.clone()
            }
            None => {
                trace!(target: "addrmgr", "Found new address {} via {}", addr, source);

                self.index.insert(
                    key.clone(),
                    KnownAddress::new(addr.clone(), source.clone(), subnetwork.clone()),
                );
                self.partition_mut(&subnetwork).n_new += 1;

                subnetwork
            }
        };
        let bucket = bucket::new_bucket(&self.secret, &addr, source);
        let p = self.partition_mut(&partition);

        if p.new[bucket].contains(&key) {
            return false;
        }
        if p.new[bucket].len() >= NEW_BUCKET_SIZE {
            self.expire_new(&partition, bucket);
        }
        self.partition_mut(&partition).new[bucket].push(key.clone());

        if let Some(ka) = self.index.get_mut(&key) {
            ka.refs += 1;
        }
        true
    }

    /// Add many addresses heard about from the same source.
    ///
    /// Returns the number of addresses placed in a bucket.
    pub fn observe_many(
        &mut self,
        addrs: impl IntoIterator<Item = NetAddr>,
        source: &NetAddr,
        subnetwork: Option<SubnetworkId>,
    ) -> usize {
        let mut count = 0;

        for addr in addrs {
            if self.observe(addr, source, subnetwork.clone()) {
                count += 1;
            }
        }
        debug!(
            target: "addrmgr",
            "Added {} address(es) from {}, {} known",
            count,
            source,
            self.len()
        );
        count
    }

    /// Called when we tried to connect to an address.
    pub fn record_attempt(&mut self, addr: &NetAddr) {
        let now = self.clock.local_time();
        let key = addr.key();

        self.in_flight.remove(&key);

        if let Some(ka) = self.index.get_mut(&key) {
            ka.attempts = ka.attempts.saturating_add(1);
            ka.last_attempt = Some(now);
        }
    }

    /// Called when we completed a handshake with a peer. Moves the address to
    /// a *tried* bucket, in the partition of the subnetwork the peer serves.
    pub fn record_success(&mut self, addr: &NetAddr, subnetwork: Option<SubnetworkId>) {
        let now = self.clock.local_time();
        let key = addr.key();

        self.in_flight.remove(&key);

        let (stored, previous, was_tried) = match self.index.get_mut(&key) {
            Some(ka) => {
                ka.last_success = Some(now);
                ka.last_attempt = Some(now);
                ka.attempts = 0;

                let previous = std::mem::replace(&mut ka.subnetwork, subnetwork.clone());
                (ka.addr.clone(), previous, ka.tried)
            }
            None => return,
        };
        let t = bucket::tried_bucket(&self.secret, &stored);
        let mut fallback = None;

        if was_tried {
            if previous == subnetwork {
                return;
            }
            debug!(
                target: "addrmgr",
                "Moving {} to subnetwork {}",
                stored,
                display(&subnetwork)
            );
            let p = self.partition_mut(&previous);
            let before = p.tried[t].len();

            p.tried[t].retain(|k| k != &key);
            p.n_tried = p.n_tried.saturating_sub(before - p.tried[t].len());
        } else {
            let refs = self.index.get(&key).map_or(0, |ka| ka.refs);
            let p = self.partition_mut(&previous);
            let mut found = 0;

            for (i, b) in p.new.iter_mut().enumerate() {
                if found == refs {
                    break;
                }
                if let Some(pos) = b.iter().position(|k| k == &key) {
                    b.remove(pos);
                    fallback.get_or_insert(i);
                    found += 1;
                }
            }
            if found > 0 {
                p.n_new = p.n_new.saturating_sub(1);
            }
        }
        if let Some(ka) = self.index.get_mut(&key) {
            ka.refs = 0;
            ka.tried = true;
        }

        // Room in the tried bucket, we're done.
        let p = self.partition_mut(&subnetwork);
        if p.tried[t].len() < TRIED_BUCKET_SIZE {
            p.tried[t].push(key);
            p.n_tried += 1;

            return;
        }

        // Otherwise, make room by moving the eldest address back to a new bucket.
        let Some((pos, victim)) = self
            .partitions
            .get(&subnetwork)
            .and_then(|p| self.eldest(&p.tried[t]))
        else {
            return;
        };
        self.partition_mut(&subnetwork).tried[t][pos] = key;

        self.demote(victim, &subnetwork, fallback);
    }

    /// Called when a connection with a peer was established. Refreshes the
    /// advertised timestamp so that long-lived peers don't look stale.
    pub fn mark_connected(&mut self, addr: &NetAddr) {
        let now = self.clock.local_time();

        if let Some(ka) = self.index.get_mut(&addr.key()) {
            if now - ka.addr.timestamp > CONNECTED_REFRESH {
                ka.addr = ka.addr.with_timestamp(now);
            }
        }
    }

    /// Pick an address to connect to, from the local node's subnetwork.
    ///
    /// Tried and new addresses are chosen with equal probability. Within them,
    /// addresses that failed or were attempted recently are less likely to be picked.
    /// The returned address is *in flight* until reported on with
    /// [`AddressManager::record_attempt`] or [`AddressManager::record_success`], and
    /// is not returned again until then.
    pub fn select_one(&mut self) -> Option<KnownAddress> {
        let now = self.clock.local_time();
        let p = self.partitions.get(&self.cfg.local_subnetwork)?;

        if p.is_empty() {
            return None;
        }
        let tried = p.n_tried > 0 && (p.n_new == 0 || self.rng.bool());
        let buckets = if tried { &p.tried } else { &p.new };
        let candidates = buckets
            .iter()
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            warn!(target: "addrmgr", "Bucket counters are out of sync with bucket contents");
            return None;
        }
        let mut factor = 1.0f64;

        let key = loop {
            let bucket = candidates[self.rng.usize(..candidates.len())];
            let key = &bucket[self.rng.usize(..bucket.len())];
            let chance = self.index.get(key).map_or(0.0, |ka| ka.chance(now));

            if self.rng.f64() < factor * chance || !factor.is_finite() {
                break key.clone();
            }
            factor *= 1.2;
        };

        if !self.in_flight.insert(key.clone()) {
            trace!(target: "addrmgr", "Selected address {} is already in flight", key);
            return None;
        }
        self.index.get(&key).cloned()
    }

    /// Pick a random subset of known addresses to share with a peer.
    ///
    /// Only addresses of the given subnetwork are returned, unless
    /// `include_all_subnetworks` is set.
    pub fn snapshot_candidates(
        &mut self,
        include_all_subnetworks: bool,
        subnetwork: Option<&SubnetworkId>,
    ) -> Vec<NetAddr> {
        let mut addrs = self
            .index
            .values()
            .filter(|ka| include_all_subnetworks || ka.subnetwork.as_ref() == subnetwork)
            .map(|ka| ka.addr.clone())
            .collect::<Vec<_>>();

        let total = addrs.len();
        let count = if total < GET_ADDR_MIN {
            total
        } else {
            (total * GET_ADDR_PERCENT / 100).clamp(GET_ADDR_MIN, GET_ADDR_MAX)
        };

        // Partial Fisher-Yates shuffle.
        for i in 0..count {
            let j = self.rng.usize(i..total);
            addrs.swap(i, j);
        }
        addrs.truncate(count);
        addrs
    }

    /// Check the internal consistency of the address manager.
    pub fn verify(&self) -> Result<(), String> {
        for key in self.in_flight.iter() {
            if !self.index.contains_key(key) {
                return Err(format!("in-flight address {} is unknown", key));
            }
        }
        let mut refs: HashMap<&AddrKey, u8> = HashMap::new();
        let mut tried: HashSet<&AddrKey> = HashSet::new();

        for (id, p) in self.partitions.iter() {
            let (mut n_new, mut n_tried) = (HashSet::new(), 0);

            for (kind, buckets, limit) in [("new", &p.new, NEW_BUCKET_SIZE), ("tried", &p.tried, TRIED_BUCKET_SIZE)] {
                for (i, b) in buckets.iter().enumerate() {
                    if b.len() > limit {
                        return Err(format!("{} bucket {} holds {} addresses", kind, i, b.len()));
                    }
                    let mut seen = HashSet::new();

                    for key in b {
                        let ka = self
                            .index
                            .get(key)
                            .ok_or_else(|| format!("{} bucket {} refers to unknown address {}", kind, i, key))?;

                        if !seen.insert(key) {
                            return Err(format!("address {} appears twice in {} bucket {}", key, kind, i));
                        }
                        if &ka.subnetwork != id {
                            return Err(format!(
                                "address {} of subnetwork {} is in partition {}",
                                key,
                                display(&ka.subnetwork),
                                display(id)
                            ));
                        }
                        if kind == "new" {
                            let r = refs.entry(key).or_default();
                            *r = r.saturating_add(1);
                            n_new.insert(key);
                        } else {
                            if !tried.insert(key) {
                                return Err(format!("address {} is in more than one tried bucket", key));
                            }
                            n_tried += 1;
                        }
                    }
                }
            }
            if n_new.len() != p.n_new || n_tried != p.n_tried {
                return Err(format!(
                    "partition {} counts {}/{} new/tried, holds {}/{}",
                    display(id),
                    p.n_new,
                    p.n_tried,
                    n_new.len(),
                    n_tried
                ));
            }
        }
        for (key, ka) in self.index.iter() {
            let r = refs.get(key).copied().unwrap_or(0);

            if r != ka.refs {
                return Err(format!("address {} has {} refs, found in {} buckets", key, ka.refs, r));
            }
            if r > NEW_BUCKETS_PER_ADDRESS {
                return Err(format!("address {} is in {} new buckets", key, r));
            }
            if ka.tried != tried.contains(key) {
                return Err(format!("address {} tried flag is out of sync", key));
            }
            if (ka.refs > 0) == ka.tried {
                return Err(format!("address {} is both or neither new and tried", key));
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////

    fn partition(&self, subnetwork: Option<&SubnetworkId>) -> Option<&Partition> {
        self.partitions.get(&subnetwork.cloned())
    }

    fn partition_mut(&mut self, subnetwork: &Option<SubnetworkId>) -> &mut Partition {
        self.partitions.entry(subnetwork.clone()).or_default()
    }

    /// Position and key of the address advertised longest ago. Ties go to the
    /// earliest entry.
    fn eldest(&self, bucket: &[AddrKey]) -> Option<(usize, AddrKey)> {
        bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, k)| self.index.get(*k).map(|ka| ka.addr.timestamp))
            .map(|(i, k)| (i, k.clone()))
    }

    /// Make room in a full *new* bucket. Bad addresses are removed; if there are
    /// none, the address advertised longest ago is.
    fn expire_new(&mut self, subnetwork: &Option<SubnetworkId>, bucket: usize) {
        let now = self.clock.local_time();
        let Some(p) = self.partitions.get(subnetwork) else {
            return;
        };
        let bad = p.new[bucket]
            .iter()
            .filter(|k| self.index.get(*k).map_or(true, |ka| ka.is_bad(now)))
            .cloned()
            .collect::<Vec<_>>();

        if bad.is_empty() {
            if let Some((_, key)) = self.eldest(&p.new[bucket]) {
                debug!(target: "addrmgr", "Expiring oldest address {} from new bucket {}", key, bucket);
                self.remove_from_new(subnetwork, bucket, &key);
            }
        } else {
            for key in bad {
                debug!(target: "addrmgr", "Expiring bad address {} from new bucket {}", key, bucket);
                self.remove_from_new(subnetwork, bucket, &key);
            }
        }
    }

    /// Remove an address from a *new* bucket, forgetting it if no other bucket
    /// refers to it.
    fn remove_from_new(&mut self, subnetwork: &Option<SubnetworkId>, bucket: usize, key: &AddrKey) {
        let p = self.partition_mut(subnetwork);
        p.new[bucket].retain(|k| k != key);

        let forget = match self.index.get_mut(key) {
            Some(ka) => {
                ka.refs = ka.refs.saturating_sub(1);
                ka.refs == 0 && !ka.tried
            }
            None => false,
        };
        if forget {
            self.index.remove(key);
            self.in_flight.remove(key);

            let p = self.partition_mut(subnetwork);
            p.n_new = p.n_new.saturating_sub(1);
        }
    }

    /// Move an address evicted from a *tried* bucket back to a *new* bucket of the
    /// same partition, or forget it if there's no room.
    fn demote(&mut self, key: AddrKey, subnetwork: &Option<SubnetworkId>, fallback: Option<usize>) {
        let Some(ka) = self.index.get(&key) else {
            return;
        };
        let preferred = bucket::new_bucket(&self.secret, &ka.addr, &ka.source);
        let p = self.partition_mut(subnetwork);
        let has_room = |b: &usize| p.new[*b].len() < NEW_BUCKET_SIZE;

        let target = Some(preferred)
            .filter(&has_room)
            .or_else(|| fallback.filter(&has_room))
            .or_else(|| p.new.iter().position(|b| b.len() < NEW_BUCKET_SIZE));

        match target {
            Some(b) => {
                debug!(target: "addrmgr", "Moving evicted address {} to new bucket {}", key, b);

                p.new[b].push(key.clone());
                p.n_new += 1;

                if let Some(ka) = self.index.get_mut(&key) {
                    ka.tried = false;
                    ka.refs = 1;
                }
            }
            None => {
                debug!(target: "addrmgr", "Dropping evicted address {}: no room left", key);

                self.index.remove(&key);
                self.in_flight.remove(&key);
            }
        }
    }
}

/// Seed the sampling generator from the secret.
fn rng(secret: &[u8; 32]) -> fastrand::Rng {
    let seed = secret.chunks(8).fold(0u64, |acc, chunk| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        acc ^ u64::from_le_bytes(bytes)
    });
    fastrand::Rng::with_seed(seed)
}

/// Human-readable name of a partition.
fn display(subnetwork: &Option<SubnetworkId>) -> String {
    match subnetwork {
        Some(id) => id.to_string(),
        None => String::from("full"),
    }
}
