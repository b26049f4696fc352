//! Random generators for property tests.
use std::net;

use quickcheck::{Arbitrary, Gen};

use crate::address::{NetAddr, ServiceFlags, SubnetworkId};
use crate::time::LocalTime;

/// A fixed point in time around which generated timestamps are spread.
pub const EPOCH: LocalTime = LocalTime::from_secs(1_700_000_000);

/// Generate a routable IPv4 address.
pub fn routable_ipv4(rng: &fastrand::Rng) -> net::Ipv4Addr {
    loop {
        let ip = net::Ipv4Addr::from(rng.u32(..));
        let addr = NetAddr::new(ip.into(), 0, ServiceFlags::NONE, EPOCH);

        if addr.is_routable() {
            return ip;
        }
    }
}

impl Arbitrary for NetAddr {
    fn arbitrary(g: &mut Gen) -> Self {
        let rng = fastrand::Rng::with_seed(u64::arbitrary(g));
        let port = rng.u16(1..);
        let services = ServiceFlags::from(rng.u64(0..8));
        let timestamp = EPOCH - crate::time::LocalDuration::from_secs(rng.u64(0..60 * 60 * 24));

        // Mostly IPv4, with the occasional IPv6 and onion address.
        match rng.u8(0..10) {
            0 => {
                let mut name = [0u8; 10];
                name.iter_mut().for_each(|b| *b = rng.u8(..));

                NetAddr::onion(name, port, services, timestamp)
            }
            1 => {
                let mut octets = [0u8; 16];
                octets.iter_mut().for_each(|b| *b = rng.u8(..));
                // Global unicast, `2000::/3`.
                octets[0] = 0x2a;

                NetAddr::new(net::Ipv6Addr::from(octets).into(), port, services, timestamp)
            }
            _ => NetAddr::new(routable_ipv4(&rng).into(), port, services, timestamp),
        }
    }
}

impl Arbitrary for SubnetworkId {
    fn arbitrary(g: &mut Gen) -> Self {
        // Keep the number of distinct subnetworks small so that partitions get shared.
        let tag = *g.choose(&[1u8, 2, 3]).unwrap_or(&1);
        let mut bytes = [0u8; SubnetworkId::LEN];
        bytes[SubnetworkId::LEN - 1] = tag;

        SubnetworkId::new(bytes)
    }
}
