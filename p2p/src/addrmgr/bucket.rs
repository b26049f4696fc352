//! Keyed bucket assignment.
//!
//! Every address lands in a bucket chosen by hashing its group together with a
//! secret only we know. An adversary can't predict which bucket its addresses
//! will land in, and addresses from one source group can only ever spread over
//! [`NEW_BUCKETS_PER_GROUP`] *new* buckets, which limits how much of the table a
//! single source can fill.
use bitcoin_hashes::{sha256d, Hash};

use peerpool_common::{AddrKey, NetAddr};

/// Number of *new* buckets per partition.
pub const NEW_BUCKET_COUNT: usize = 1024;
/// Maximum number of addresses in a *new* bucket.
pub const NEW_BUCKET_SIZE: usize = 64;
/// Number of *new* buckets a single source group can spread over.
pub const NEW_BUCKETS_PER_GROUP: u64 = 64;
/// Maximum number of *new* buckets a single address can be in.
pub const NEW_BUCKETS_PER_ADDRESS: u8 = 8;
/// Number of *tried* buckets per partition.
pub const TRIED_BUCKET_COUNT: usize = 64;
/// Maximum number of addresses in a *tried* bucket.
pub const TRIED_BUCKET_SIZE: usize = 256;
/// Number of *tried* buckets a single address group can spread over.
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// The buckets of one partition of the address space.
///
/// There is one partition per subnetwork, plus one for full nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// *New* buckets, in insertion order.
    pub new: Vec<Vec<AddrKey>>,
    /// *Tried* buckets, oldest first.
    pub tried: Vec<Vec<AddrKey>>,
    /// Number of distinct addresses in the *new* buckets.
    pub n_new: usize,
    /// Number of addresses in the *tried* buckets.
    pub n_tried: usize,
}

impl Default for Partition {
    fn default() -> Self {
        Self {
            new: vec![Vec::new(); NEW_BUCKET_COUNT],
            tried: vec![Vec::new(); TRIED_BUCKET_COUNT],
            n_new: 0,
            n_tried: 0,
        }
    }
}

impl Partition {
    /// Number of addresses in this partition.
    pub fn len(&self) -> usize {
        self.n_new + self.n_tried
    }

    /// Whether this partition holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First eight bytes of the double-SHA256 of the input, as a little-endian integer.
pub fn hash(data: &[u8]) -> u64 {
    let digest = sha256d::Hash::hash(data).into_inner();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);

    u64::from_le_bytes(bytes)
}

/// The *new* bucket for an address heard about from `source`.
pub fn new_bucket(secret: &[u8; 32], addr: &NetAddr, source: &NetAddr) -> usize {
    let source_group = source.group();

    let mut data = secret.to_vec();
    data.extend(addr.group());
    data.extend(&source_group);
    let h1 = hash(&data) % NEW_BUCKETS_PER_GROUP;

    let mut data = secret.to_vec();
    data.extend(&source_group);
    data.extend(h1.to_le_bytes());

    (hash(&data) % NEW_BUCKET_COUNT as u64) as usize
}

/// The *tried* bucket for an address.
pub fn tried_bucket(secret: &[u8; 32], addr: &NetAddr) -> usize {
    let mut data = secret.to_vec();
    data.extend(addr.key().as_str().as_bytes());
    let h1 = hash(&data) % TRIED_BUCKETS_PER_GROUP;

    let mut data = secret.to_vec();
    data.extend(addr.group());
    data.extend(h1.to_le_bytes());

    (hash(&data) % TRIED_BUCKET_COUNT as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use peerpool_common::{LocalTime, ServiceFlags};
    use quickcheck_macros::quickcheck;

    fn addr(ip: [u8; 4], port: u16) -> NetAddr {
        NetAddr::new(ip.into(), port, ServiceFlags::NONE, LocalTime::default())
    }

    #[test]
    fn test_hash() {
        // Double-SHA256 of the empty string is `5df6e0e2761359d3...`.
        assert_eq!(hash(&[]), u64::from_le_bytes([0x5d, 0xf6, 0xe0, 0xe2, 0x76, 0x13, 0x59, 0xd3]));
    }

    #[test]
    fn test_new_bucket_source_spread() {
        let secret = [7; 32];
        let source = addr([77, 1, 1, 1], 16111);
        let mut buckets = HashSet::new();

        for i in 0..=255 {
            for j in 0..16 {
                buckets.insert(new_bucket(&secret, &addr([i, j, 3, 4], 16111), &source));
            }
        }
        assert!(buckets.len() <= NEW_BUCKETS_PER_GROUP as usize);
        assert!(buckets.len() > 1);
    }

    #[test]
    fn test_tried_bucket_group_spread() {
        let secret = [9; 32];
        let mut buckets = HashSet::new();

        for i in 0..=255 {
            buckets.insert(tried_bucket(&secret, &addr([45, 33, 7, i], 16111)));
        }
        assert!(buckets.len() <= TRIED_BUCKETS_PER_GROUP as usize);
    }

    #[test]
    fn test_secret_changes_buckets() {
        let a = addr([45, 33, 7, 1], 16111);
        let src = addr([101, 1, 1, 1], 16111);
        let buckets = (0..32)
            .map(|i| new_bucket(&[i; 32], &a, &src))
            .collect::<HashSet<_>>();

        assert!(buckets.len() > 1);
    }

    #[quickcheck]
    fn prop_buckets_in_range(secret: Vec<u8>, a: NetAddr, src: NetAddr) -> bool {
        let mut key = [0; 32];
        for (k, s) in key.iter_mut().zip(secret) {
            *k = s;
        }
        new_bucket(&key, &a, &src) < NEW_BUCKET_COUNT && tried_bucket(&key, &a) < TRIED_BUCKET_COUNT
    }
}
