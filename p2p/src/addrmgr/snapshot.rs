//! Persistent form of the address manager.
//!
//! The document holds the secret, every known address, and the bucket
//! membership of each partition, sealed with a checksum over all of it.
//! Reference counts and the *tried* flag are not stored: they are rebuilt from
//! bucket membership when the document is read.
use std::collections::{HashMap, HashSet};

use microserde::json::{Array, Number, Object, Value};

use peerpool_common::address;
use peerpool_common::time::{Clock, LocalTime};
use peerpool_common::{AddrKey, ServiceFlags, SubnetworkId};

use super::bucket::{Partition, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT};
use super::{AddressManager, Config, KnownAddress};
use crate::error::Error;
use crate::json::{
    as_array, as_object, as_str, as_u64, digest, field, time_from_json, time_to_json,
};

/// Version of the document layout.
pub const SERIAL_VERSION: u64 = 1;
/// Document field holding the checksum of all other fields.
pub const CHECKSUM_FIELD: &str = "checksum";

impl<C: Clock> AddressManager<C> {
    /// Encode the address manager state as a JSON document.
    pub fn to_json(&self) -> Value {
        let mut obj = Object::new();
        let addresses: Array = self.index.values().map(known_to_json).collect();

        let mut new_buckets = Object::new();
        let mut tried_buckets = Object::new();
        let full = Partition::default();

        for (id, p) in self.partitions.iter() {
            if let Some(id) = id {
                new_buckets.insert(id.to_string(), buckets_to_json(&p.new));
                tried_buckets.insert(id.to_string(), buckets_to_json(&p.tried));
            }
        }
        let full = self.partitions.get(&None).unwrap_or(&full);

        obj.insert("version".to_owned(), Value::Number(Number::U64(SERIAL_VERSION)));
        obj.insert(
            "secret".to_owned(),
            Value::String(bitcoin_hashes::hex::ToHex::to_hex(&self.secret[..])),
        );
        obj.insert("addresses".to_owned(), Value::Array(addresses));
        obj.insert("new_buckets".to_owned(), Value::Object(new_buckets));
        obj.insert("new_buckets_full_nodes".to_owned(), buckets_to_json(&full.new));
        obj.insert("tried_buckets".to_owned(), Value::Object(tried_buckets));
        obj.insert("tried_buckets_full_nodes".to_owned(), buckets_to_json(&full.tried));

        let checksum = digest(&obj, CHECKSUM_FIELD);
        obj.insert(CHECKSUM_FIELD.to_owned(), Value::String(checksum));

        Value::Object(obj)
    }

    /// Replace the address manager state with the one described by a JSON document.
    ///
    /// The document is checked for consistency before anything is replaced: on
    /// error, the address manager is left untouched.
    pub fn restore(&mut self, value: &Value) -> Result<(), Error> {
        *self = Self::from_json(self.cfg.clone(), value, self.clock.clone())?;

        Ok(())
    }

    /// Build an address manager from a JSON document written by [`AddressManager::to_json`].
    pub fn from_json(cfg: Config, value: &Value, clock: C) -> Result<Self, Error> {
        let obj = as_object(value, "document")?;

        let version = as_u64(field(obj, "version")?, "version")?;
        if version != SERIAL_VERSION {
            return Err(Error::Version {
                found: version,
                expected: SERIAL_VERSION,
            });
        }
        if as_str(field(obj, CHECKSUM_FIELD)?, CHECKSUM_FIELD)? != digest(obj, CHECKSUM_FIELD) {
            return Err(Error::Checksum);
        }
        let secret = parse_secret(as_str(field(obj, "secret")?, "secret")?)?;

        let mut index = HashMap::new();
        for v in as_array(field(obj, "addresses")?, "addresses")?.iter() {
            let ka = known_from_json(v)?;
            let key = ka.addr.key();

            if !ka.addr.is_routable() {
                return Err(Error::Invalid(format!("address {} is not routable", key)));
            }
            if index.insert(key.clone(), ka).is_some() {
                return Err(Error::Invalid(format!("address {} is listed twice", key)));
            }
        }

        let mut partitions = HashMap::new();
        let mut sections = vec![(
            None,
            field(obj, "new_buckets_full_nodes")?,
            field(obj, "tried_buckets_full_nodes")?,
        )];
        let tried = as_object(field(obj, "tried_buckets")?, "tried_buckets")?;

        for (id, new) in as_object(field(obj, "new_buckets")?, "new_buckets")?.iter() {
            let tried = tried
                .get(id)
                .ok_or_else(|| Error::Parse(format!("missing tried buckets of subnetwork {}", id)))?;
            let id = id.parse::<SubnetworkId>().map_err(Error::from)?;

            sections.push((Some(id), new, tried));
        }
        if tried.len() + 1 != sections.len() {
            return Err(Error::Parse(String::from("tried buckets without new buckets")));
        }
        for (id, new, tried) in sections {
            let mut p = Partition::default();

            fill(&mut index, &mut p, &id, new, false)?;
            fill(&mut index, &mut p, &id, tried, true)?;

            partitions.insert(id, p);
        }

        let restored = AddressManager {
            secret,
            index,
            partitions,
            in_flight: HashSet::new(),
            cfg,
            rng: super::rng(&secret),
            clock,
        };
        restored.verify().map_err(Error::Invalid)?;

        Ok(restored)
    }
}

/// Place the addresses listed in `buckets` into a partition, rebuilding reference
/// counts and counters.
fn fill(
    index: &mut HashMap<AddrKey, KnownAddress>,
    partition: &mut Partition,
    id: &Option<SubnetworkId>,
    buckets: &Value,
    tried: bool,
) -> Result<(), Error> {
    let (kind, count) = if tried {
        ("tried", TRIED_BUCKET_COUNT)
    } else {
        ("new", NEW_BUCKET_COUNT)
    };
    let buckets = as_array(buckets, kind)?;

    if buckets.len() != count {
        return Err(Error::Parse(format!(
            "expected {} {} buckets, found {}",
            count,
            kind,
            buckets.len()
        )));
    }
    for (i, bucket) in buckets.iter().enumerate() {
        for key in as_array(bucket, kind)?.iter() {
            let key = as_str(key, kind)?;
            let ka = index
                .get_mut(key)
                .ok_or_else(|| Error::Invalid(format!("{} bucket {} refers to unknown address {}", kind, i, key)))?;

            if &ka.subnetwork != id {
                return Err(Error::Invalid(format!("address {} is in the wrong partition", key)));
            }
            if tried {
                if ka.tried {
                    return Err(Error::Invalid(format!("address {} is tried twice", key)));
                }
                ka.tried = true;
                partition.n_tried += 1;
                partition.tried[i].push(ka.addr.key());
            } else {
                if ka.refs >= NEW_BUCKETS_PER_ADDRESS {
                    return Err(Error::Invalid(format!("address {} is in too many new buckets", key)));
                }
                if ka.refs == 0 {
                    partition.n_new += 1;
                }
                ka.refs += 1;
                partition.new[i].push(ka.addr.key());
            }
        }
    }
    Ok(())
}

fn buckets_to_json(buckets: &[Vec<AddrKey>]) -> Value {
    Value::Array(
        buckets
            .iter()
            .map(|b| {
                Value::Array(
                    b.iter()
                        .map(|k| Value::String(k.as_str().to_owned()))
                        .collect(),
                )
            })
            .collect(),
    )
}

fn known_to_json(ka: &KnownAddress) -> Value {
    let mut obj = Object::new();
    let subnetwork = ka
        .subnetwork
        .as_ref()
        .map_or_else(String::new, |id| id.to_string());

    obj.insert("addr".to_owned(), Value::String(ka.addr.key().as_str().to_owned()));
    obj.insert("src".to_owned(), Value::String(ka.source.key().as_str().to_owned()));
    obj.insert("subnetwork".to_owned(), Value::String(subnetwork));
    obj.insert("attempts".to_owned(), Value::Number(Number::U64(ka.attempts as u64)));
    obj.insert("timestamp".to_owned(), time_to_json(Some(ka.addr.timestamp)));
    obj.insert("last_attempt".to_owned(), time_to_json(ka.last_attempt));
    obj.insert("last_success".to_owned(), time_to_json(ka.last_success));
    obj.insert(
        "services".to_owned(),
        Value::Number(Number::U64(ka.addr.services.as_u64())),
    );

    Value::Object(obj)
}

fn known_from_json(v: &Value) -> Result<KnownAddress, Error> {
    let obj = as_object(v, "address")?;

    let services = ServiceFlags::from(as_u64(field(obj, "services")?, "services")?);
    let timestamp = time_from_json(field(obj, "timestamp")?, "timestamp")?.unwrap_or_default();
    let addr = address::from_key(as_str(field(obj, "addr")?, "addr")?, services, timestamp)?;
    let source = address::from_key(
        as_str(field(obj, "src")?, "src")?,
        ServiceFlags::NONE,
        LocalTime::default(),
    )?;
    let subnetwork = match as_str(field(obj, "subnetwork")?, "subnetwork")? {
        "" => None,
        id => Some(id.parse::<SubnetworkId>()?),
    };
    let attempts = u32::try_from(as_u64(field(obj, "attempts")?, "attempts")?)
        .map_err(|_| Error::Parse(String::from("attempts out of range")))?;

    let mut ka = KnownAddress::new(addr, source, subnetwork);
    ka.attempts = attempts;
    ka.last_attempt = time_from_json(field(obj, "last_attempt")?, "last_attempt")?;
    ka.last_success = time_from_json(field(obj, "last_success")?, "last_success")?;

    Ok(ka)
}

fn parse_secret(s: &str) -> Result<[u8; 32], Error> {
    use bitcoin_hashes::hex::FromHex;

    let bytes = Vec::<u8>::from_hex(s).map_err(|e| Error::Parse(format!("secret: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Parse(String::from("secret must be 32 bytes")))
}
