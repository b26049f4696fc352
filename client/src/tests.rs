use std::fs;
use std::io;
use std::net;
use std::sync::Arc;
use std::thread;
use std::time;

use peerpool_common::time::{LocalDuration, RefClock};
use peerpool_common::ServiceFlags;
use peerpool_p2p as p2p;
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

use peerpool_test::{addr, group, logger, scattered, subnetwork, EPOCH, PORT};

use crate::dns;
use crate::error::Error;
use crate::peers;
use crate::pool::{Config, Pool};
use crate::Priority;

fn config(dir: &tempfile::TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

fn pool(dir: &tempfile::TempDir) -> Pool<RefClock> {
    Pool::with_clock(config(dir), dns::offline(), RefClock::from(EPOCH))
}

#[test]
fn test_corrupt_peers_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(peers::FILE_NAME);
    let pool = pool(&tmp);
    let source = addr([12, 0, 0, 1], PORT);

    assert_eq!(pool.observe_many(group(45, 1, 32), &source, None), 32);
    pool.save().unwrap();

    let secret = pool.secret();
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'x';
    fs::write(&path, bytes).unwrap();

    assert!(matches!(pool.load(), Err(Error::P2p(p2p::Error::Parse(_)))));
    assert!(!path.exists(), "the corrupt file is removed");
    assert_eq!(pool.total_count(), 0);
    assert_ne!(pool.secret(), secret);
}

#[test]
fn test_tampered_peers_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(peers::FILE_NAME);
    let pool = pool(&tmp);

    pool.observe_many(group(45, 1, 32), &addr([12, 0, 0, 1], PORT), None);
    pool.save().unwrap();

    // Still valid JSON, with the version intact.
    let secret = pool.secret();
    let s = fs::read_to_string(&path).unwrap();
    let at = s.find("\"secret\":\"").unwrap() + "\"secret\":\"".len() + 20;
    let digit = if &s[at..at + 1] == "f" { "e" } else { "f" };
    fs::write(&path, format!("{}{}{}", &s[..at], digit, &s[at + 1..])).unwrap();

    assert!(matches!(pool.load(), Err(Error::P2p(p2p::Error::Checksum))));
    assert!(!path.exists());
    assert_eq!(pool.total_count(), 0);
    assert_ne!(pool.secret(), secret);
}

#[test]
fn test_concurrent_saves() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);
    let rng = fastrand::Rng::with_seed(7);

    pool.observe_many(scattered(&rng, 512), &addr([12, 0, 0, 1], PORT), None);
    pool.start().unwrap();

    thread::scope(|s| {
        let handles = (0..4)
            .map(|_| s.spawn(|| (0..50).map(|_| pool.save()).collect::<Vec<_>>()))
            .collect::<Vec<_>>();

        for handle in handles {
            for result in handle.join().unwrap() {
                result.unwrap();
            }
        }
    });
    pool.stop();

    let total = pool.total_count();
    let reloaded = self::pool(&tmp);

    reloaded.load().unwrap();
    assert_eq!(reloaded.total_count(), total);
    assert_eq!(reloaded.secret(), pool.secret());
}

#[test]
fn test_load_absent() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);

    pool.load().unwrap();
    assert_eq!(pool.total_count(), 0);
}

#[test]
fn test_load_version_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(peers::FILE_NAME);
    let pool = pool(&tmp);

    pool.observe_one(addr([45, 1, 0, 1], PORT), &addr([12, 0, 0, 1], PORT), None);
    pool.save().unwrap();

    let s = fs::read_to_string(&path).unwrap();
    fs::write(&path, s.replacen("\"version\":1", "\"version\":2", 1)).unwrap();

    assert!(matches!(
        pool.load(),
        Err(Error::P2p(p2p::Error::Version {
            found: 2,
            expected: 1
        }))
    ));
    assert!(!path.exists());
    assert!(pool.total_count() == 0);
}

#[test]
fn test_start_stop_restart() {
    logger::init(log::Level::Debug);

    let tmp = tempfile::tempdir().unwrap();
    let source = addr([12, 0, 0, 1], PORT);
    let (total, secret) = {
        let pool = pool(&tmp);

        pool.start().unwrap();
        pool.start().unwrap();
        assert!(pool.is_running());

        pool.observe_many(group(45, 1, 16), &source, None);
        pool.observe_many(group(46, 2, 16), &source, Some(subnetwork(1)));
        pool.record_success(&addr([45, 1, 0, 1], PORT), None);

        pool.stop();
        pool.stop();
        assert!(!pool.is_running());

        (pool.total_count(), pool.secret())
    };
    assert!(tmp.path().join(peers::FILE_NAME).exists());

    let pool = pool(&tmp);
    pool.start().unwrap();

    assert_eq!(pool.total_count(), total);
    assert_eq!(pool.secret(), secret);
    assert_eq!(pool.tried_count(None), 1);
    assert_eq!(pool.new_count(Some(&subnetwork(1))), 16);
}

#[test]
fn test_start_with_corrupt_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(peers::FILE_NAME);

    fs::write(&path, b"not json").unwrap();

    let pool = pool(&tmp);
    pool.start().unwrap();

    assert!(pool.is_running());
    assert_eq!(pool.total_count(), 0);
}

#[test]
fn test_snapshot_ticker() {
    logger::init(log::Level::Debug);

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("data").join(peers::FILE_NAME);
    let cfg = Config {
        data_dir: tmp.path().join("data"),
        snapshot_interval: LocalDuration::from_millis(20),
        ..Config::default()
    };
    let pool = Pool::with_clock(cfg, dns::offline(), RefClock::from(EPOCH));

    pool.start().unwrap();
    pool.observe_one(addr([45, 1, 0, 1], PORT), &addr([12, 0, 0, 1], PORT), None);

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    loop {
        let written = fs::read_to_string(&path)
            .map(|s| s.contains("45.1.0.1:16111"))
            .unwrap_or(false);
        if written {
            break;
        }
        assert!(time::Instant::now() < deadline, "snapshot was never written");
        thread::sleep(time::Duration::from_millis(10));
    }
    pool.stop();
}

#[test]
fn test_drop_saves() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let pool = pool(&tmp);
        pool.start().unwrap();
        pool.observe_one(addr([45, 1, 0, 1], PORT), &addr([12, 0, 0, 1], PORT), None);
    }
    let pool = pool(&tmp);
    pool.load().unwrap();

    assert_eq!(pool.total_count(), 1);
}

#[test]
fn test_observe_by_string() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = RefClock::from(EPOCH);
    let lookup: dns::Lookup = Arc::new(|host: &str| {
        if host == "seed.example.com" {
            Ok(vec![net::IpAddr::from([45, 9, 9, 9])])
        } else {
            Err(io::ErrorKind::NotFound.into())
        }
    });
    let pool = Pool::with_clock(config(&tmp), lookup, clock.clone());
    let source = addr([12, 0, 0, 1], PORT);

    clock.elapse(LocalDuration::from_mins(5));

    assert!(pool
        .observe_by_string("45.1.0.1:16111", &source, ServiceFlags::NETWORK, None)
        .unwrap());
    assert!(pool
        .observe_by_string("[2001:db9::1]:16111", &source, ServiceFlags::NETWORK, None)
        .unwrap());
    assert!(pool
        .observe_by_string("seed.example.com:16111", &source, ServiceFlags::NONE, None)
        .unwrap());
    assert_eq!(pool.total_count(), 3);

    assert!(matches!(
        pool.observe_by_string("45.1.0.1", &source, ServiceFlags::NETWORK, None),
        Err(Error::Address(_))
    ));
    assert!(matches!(
        pool.observe_by_string("45.1.0.1:http", &source, ServiceFlags::NETWORK, None),
        Err(Error::Address(_))
    ));
    assert!(matches!(
        pool.observe_by_string("unknown.example.com:1", &source, ServiceFlags::NETWORK, None),
        Err(Error::Address(_))
    ));
    assert_eq!(pool.total_count(), 3);

    let resolved = pool.get(&addr([45, 9, 9, 9], PORT)).unwrap();
    assert_eq!(resolved.addr.timestamp, EPOCH + LocalDuration::from_mins(5));
    assert_eq!(resolved.addr.services, ServiceFlags::NONE);
}

#[quickcheck]
fn prop_observe_by_string_literal(ip: (u8, u8, u8, u8), port: u16) -> TestResult {
    let target = addr([ip.0, ip.1, ip.2, ip.3], port);
    if !target.is_routable() {
        return TestResult::discard();
    }
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);
    let added = pool
        .observe_by_string(target.key().as_str(), &addr([12, 0, 0, 1], PORT), ServiceFlags::NETWORK, None)
        .unwrap();

    TestResult::from_bool(added && pool.get(&target).map(|ka| ka.addr) == Some(target))
}

#[test]
fn test_select_and_report() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);
    let a = addr([45, 1, 0, 1], PORT);

    assert!(pool.select_one().is_none());

    pool.observe_one(a.clone(), &addr([12, 0, 0, 1], PORT), None);

    let selected = pool.select_one().unwrap();
    assert_eq!(selected.addr, a);
    assert!(pool.select_one().is_none(), "the address is in flight");

    pool.record_attempt(&a);
    pool.record_success(&a, None);
    pool.mark_connected(&a);

    assert_eq!(pool.tried_count(None), 1);
    assert_eq!(pool.new_count(None), 0);
    assert_eq!(pool.snapshot_candidates(false, None), vec![a]);
    assert!(pool.need_more());
}

#[test]
fn test_local_addresses() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);
    let local = addr([45, 0, 0, 1], PORT);
    let remote = addr([46, 0, 0, 1], PORT);

    assert!(matches!(
        pool.register_local(addr([127, 0, 0, 1], PORT), Priority::Manual),
        Err(Error::P2p(p2p::Error::NotRoutable(_)))
    ));
    assert_eq!(pool.best_local_for(&remote).ip_addr(), net::IpAddr::from([0, 0, 0, 0]));

    pool.register_local(local.clone(), Priority::Bound).unwrap();

    assert!(pool.has_local_address(&local));
    assert_eq!(pool.local_addresses().len(), 1);
    assert_eq!(pool.best_local_for(&remote), local);
}

#[test]
fn test_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool(&tmp);
    let secret = pool.secret();

    pool.observe_many(group(45, 1, 8), &addr([12, 0, 0, 1], PORT), None);
    pool.reset();

    assert_eq!(pool.total_count(), 0);
    assert_ne!(pool.secret(), secret);
}
