//! Shared fixtures for peerpool tests.
use std::net;

use peerpool_common::{LocalTime, NetAddr, ServiceFlags, SubnetworkId};

/// Time at which fixture addresses were last advertised.
pub const EPOCH: LocalTime = LocalTime::from_secs(1_700_000_000);

/// Default port of fixture addresses.
pub const PORT: u16 = 16111;

/// A network address advertised at [`EPOCH`].
pub fn addr(ip: [u8; 4], port: u16) -> NetAddr {
    NetAddr::new(
        net::Ipv4Addr::from(ip).into(),
        port,
        ServiceFlags::NETWORK,
        EPOCH,
    )
}

/// `count` distinct addresses sharing the `/16` group `a.b`.
pub fn group(a: u8, b: u8, count: usize) -> Vec<NetAddr> {
    (0..count)
        .map(|i| addr([a, b, (i / 254) as u8, (i % 254) as u8 + 1], PORT))
        .collect()
}

/// `count` routable addresses spread over random groups.
pub fn scattered(rng: &fastrand::Rng, count: usize) -> Vec<NetAddr> {
    (0..count)
        .map(|_| addr([rng.u8(11..100), rng.u8(..), rng.u8(..), rng.u8(1..255)], PORT))
        .collect()
}

/// A subnetwork identifier that only differs in its last byte.
pub fn subnetwork(tag: u8) -> SubnetworkId {
    let mut bytes = [0; SubnetworkId::LEN];
    bytes[SubnetworkId::LEN - 1] = tag;

    SubnetworkId::new(bytes)
}

pub mod logger {
    use colored::*;
    use log::*;

    struct Logger {
        level: Level,
    }

    impl Log for Logger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let target = format!("[{}]", record.target());
                println!("test> {} {}", target.dimmed(), record.args())
            }
        }

        fn flush(&self) {}
    }

    pub fn init(level: Level) {
        let logger = Logger { level };

        log::set_boxed_logger(Box::new(logger)).ok();
        log::set_max_level(level.to_level_filter());
    }
}
