use std::net;
use std::path::PathBuf;
use std::process;

use argh::FromArgs;
use log::*;

use peerpool::logger;
use peerpool_client::{dns, Config, Error, Pool, Priority};
use peerpool_common::{LocalTime, NetAddr, ServiceFlags, SubnetworkId};

#[derive(FromArgs)]
/// Manage a persistent pool of peer addresses.
pub struct Options {
    #[argh(option)]
    /// directory holding `peers.json` (default: ~/.peerpool)
    pub data_dir: Option<PathBuf>,

    #[argh(option)]
    /// subnetwork served by this node, in hex (default: full node)
    pub subnetwork: Option<SubnetworkId>,

    #[argh(option)]
    /// add a seed address, as `host:port`
    pub seed: Vec<String>,

    #[argh(option)]
    /// register one of our own addresses
    pub local: Vec<net::SocketAddr>,

    #[argh(option, default = "8")]
    /// number of addresses to select (default: 8)
    pub select: usize,

    #[argh(option, default = "log::Level::Info")]
    /// log level (default: info)
    pub log: log::Level,
}

impl Options {
    pub fn from_env() -> Self {
        argh::from_env()
    }
}

fn main() {
    let opts = Options::from_env();

    if let Err(err) = logger::init(opts.log) {
        eprintln!("peerpool: failed to initialize logger: {}", err);
    }
    if let Err(err) = run(opts) {
        error!(target: "pool", "{}", err);
        process::exit(1);
    }
}

fn run(opts: Options) -> Result<(), Error> {
    let mut cfg = Config {
        local_subnetwork: opts.subnetwork,
        ..Config::default()
    };
    if let Some(dir) = opts.data_dir {
        cfg.data_dir = dir;
    }
    let subnetwork = cfg.local_subnetwork;
    let pool = Pool::new(cfg, dns::system());

    pool.start()?;

    for addr in opts.local {
        let addr = NetAddr::from_socket_addr(&addr, ServiceFlags::NETWORK, LocalTime::now());
        pool.register_local(addr, Priority::Manual)?;
    }

    // Seeds are heard about from nobody in particular.
    let source = NetAddr::new(
        net::Ipv4Addr::UNSPECIFIED.into(),
        0,
        ServiceFlags::NONE,
        LocalTime::default(),
    );
    for seed in opts.seed.iter() {
        match pool.observe_by_string(seed, &source, ServiceFlags::NETWORK, subnetwork) {
            Ok(true) => info!(target: "pool", "Added seed {}", seed),
            Ok(false) => debug!(target: "pool", "Seed {} was not added", seed),
            Err(err) => warn!(target: "pool", "Invalid seed {}: {}", seed, err),
        }
    }

    info!(
        target: "pool",
        "{} address(es) known, {} new and {} tried in the local subnetwork",
        pool.total_count(),
        pool.new_count(subnetwork.as_ref()),
        pool.tried_count(subnetwork.as_ref())
    );

    for _ in 0..opts.select {
        let Some(ka) = pool.select_one() else {
            break;
        };
        println!(
            "{} (attempts: {}, advertising {})",
            ka.addr,
            ka.attempts,
            pool.best_local_for(&ka.addr)
        );
    }
    if pool.need_more() {
        info!(target: "pool", "The pool needs more addresses");
    }
    pool.stop();

    Ok(())
}
