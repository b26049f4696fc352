//! Known addresses and the predicates used to rank them.
use peerpool_common::time::{LocalDuration, LocalTime};
use peerpool_common::{NetAddr, SubnetworkId};

/// How many days an address may go unadvertised before it is considered bad.
pub const NUM_MISSING_DAYS: u64 = 30;
/// How many attempts an address that never succeeded gets before it is considered bad.
pub const NUM_RETRIES: u32 = 3;
/// How many consecutive failures make a once-good address bad.
pub const MAX_FAILURES: u32 = 10;
/// How many days since the last success before failures start to count.
pub const MIN_BAD_DAYS: u64 = 7;

/// Addresses attempted this recently are never bad.
const GRACE_PERIOD: LocalDuration = LocalDuration::from_mins(1);
/// Addresses attempted this recently are much less likely to be selected.
const RECENT_ATTEMPT: LocalDuration = LocalDuration::from_mins(10);
/// Addresses advertised this far into the future are bad.
const MAX_FUTURE_DRIFT: LocalDuration = LocalDuration::from_mins(10);

/// An address known to the address manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAddress {
    /// Network address, as last advertised.
    pub addr: NetAddr,
    /// Address of the peer that first told us about this address.
    pub source: NetAddr,
    /// Subnetwork the peer serves, or `None` for full nodes.
    pub subnetwork: Option<SubnetworkId>,
    /// Connection attempts since the last success.
    pub attempts: u32,
    /// Last time we tried to connect to this address.
    pub last_attempt: Option<LocalTime>,
    /// Last time we completed a handshake with this address.
    pub last_success: Option<LocalTime>,
    pub(super) tried: bool,
    pub(super) refs: u8,
}

impl KnownAddress {
    /// Create a new, untried known address.
    pub fn new(addr: NetAddr, source: NetAddr, subnetwork: Option<SubnetworkId>) -> Self {
        Self {
            addr,
            source,
            subnetwork,
            attempts: 0,
            last_attempt: None,
            last_success: None,
            tried: false,
            refs: 0,
        }
    }

    /// Whether this address is in a *tried* bucket.
    pub fn is_tried(&self) -> bool {
        self.tried
    }

    /// Number of *new* buckets referencing this address.
    pub fn refs(&self) -> u8 {
        self.refs
    }

    /// Relative chance of this address being selected for a connection, in `[0, 1]`.
    pub fn chance(&self, now: LocalTime) -> f64 {
        let mut chance = 1.0;

        if let Some(last_attempt) = self.last_attempt {
            if now - last_attempt < RECENT_ATTEMPT {
                chance *= 0.01;
            }
        }
        chance / 1.5f64.powi(self.attempts.min(i32::MAX as u32) as i32)
    }

    /// Whether this address is no longer worth keeping.
    ///
    /// An address is bad when it claims to come from the future, hasn't been advertised
    /// in a month, never worked despite retries, or stopped working a week ago and kept
    /// failing since. Addresses attempted in the last minute are spared, since the
    /// outcome of that attempt is not yet known.
    pub fn is_bad(&self, now: LocalTime) -> bool {
        if let Some(last_attempt) = self.last_attempt {
            if now - last_attempt < GRACE_PERIOD {
                return false;
            }
        }
        if self.addr.timestamp > now + MAX_FUTURE_DRIFT {
            return true;
        }
        if self.addr.timestamp < now - LocalDuration::from_days(NUM_MISSING_DAYS) {
            return true;
        }
        match self.last_success {
            None => self.attempts >= NUM_RETRIES,
            Some(last_success) => {
                last_success < now - LocalDuration::from_days(MIN_BAD_DAYS)
                    && self.attempts >= MAX_FAILURES
            }
        }
    }
}
