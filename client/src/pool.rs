//! Thread-safe peer address pool. Wraps the address manager and the local
//! address registry under a unified interface, and keeps the address manager
//! persisted in the background.
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

pub use crossbeam_channel as chan;

use log::*;

use peerpool_common::address;
use peerpool_common::dns::Lookup;
use peerpool_common::time::{Clock, LocalDuration, SystemClock};
use peerpool_common::{NetAddr, ServiceFlags, SubnetworkId};

use peerpool_p2p::addrmgr;
use peerpool_p2p::local::{LocalAddress, LocalAddresses, Priority};
use peerpool_p2p::{AddressManager, KnownAddress};

use crate::error::Error;
use crate::peers;

/// How often the address manager is written to disk.
pub const SNAPSHOT_INTERVAL: LocalDuration = LocalDuration::from_mins(10);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory where the peers file is kept.
    pub data_dir: PathBuf,
    /// Subnetwork served by the local node, `None` for a full node.
    pub local_subnetwork: Option<SubnetworkId>,
    /// How often to write a snapshot.
    pub snapshot_interval: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(env::var("HOME").unwrap_or_default()).join(".peerpool"),
            local_subnetwork: None,
            snapshot_interval: SNAPSHOT_INTERVAL,
        }
    }
}

/// State shared with the snapshot task.
struct Shared<C> {
    addrmgr: Mutex<AddressManager<C>>,
    /// Held for any access to the peers file. Never taken while `addrmgr` is held.
    file: Mutex<()>,
    path: PathBuf,
}

impl<C: Clock> Shared<C> {
    fn addrmgr(&self) -> MutexGuard<'_, AddressManager<C>> {
        self.addrmgr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn file(&self) -> MutexGuard<'_, ()> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a snapshot. The address manager is only locked while the document is built.
    fn save(&self) -> Result<(), Error> {
        let snapshot = self.addrmgr().to_json();
        let _file = self.file();

        peers::save(&self.path, &snapshot)?;

        Ok(())
    }
}

/// Handle to the running snapshot task.
struct Task {
    shutdown: chan::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// A persistent pool of peer addresses.
pub struct Pool<C: Clock = SystemClock> {
    shared: Arc<Shared<C>>,
    locals: Mutex<LocalAddresses>,
    task: Mutex<Option<Task>>,
    config: Config,
    lookup: Lookup,
    clock: C,
}

impl Pool<SystemClock> {
    /// Create a new pool. Nothing is read from disk until [`Pool::start`] is called.
    pub fn new(config: Config, lookup: Lookup) -> Self {
        Self::with_clock(config, lookup, SystemClock)
    }
}

impl<C: Clock> Pool<C> {
    /// Create a new pool that tells time with the given clock.
    pub fn with_clock(config: Config, lookup: Lookup, clock: C) -> Self {
        let cfg = addrmgr::Config {
            local_subnetwork: config.local_subnetwork,
        };
        let addrmgr = AddressManager::new(cfg, AddressManager::<C>::generate_secret(), clock.clone());

        Self {
            shared: Arc::new(Shared {
                addrmgr: Mutex::new(addrmgr),
                file: Mutex::new(()),
                path: config.data_dir.join(peers::FILE_NAME),
            }),
            locals: Mutex::new(LocalAddresses::new()),
            task: Mutex::new(None),
            config,
            lookup,
            clock,
        }
    }

    /// Load the peers file and start the snapshot task. Calling this on a started
    /// pool does nothing.
    ///
    /// A peers file that can't be read back is discarded, and the pool starts empty.
    pub fn start(&self) -> Result<(), Error> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());

        if task.is_some() {
            debug!(target: "pool", "Pool already started");
            return Ok(());
        }
        if let Err(err) = self.load() {
            warn!(target: "pool", "Starting with an empty pool: {}", err);
        }
        let (shutdown, shutdown_recv) = chan::bounded(1);
        let shared = self.shared.clone();
        let interval = self.config.snapshot_interval;

        let handle = thread::Builder::new()
            .name(String::from("pool-snapshot"))
            .spawn(move || run(shared, interval, shutdown_recv))
            .map_err(Error::Spawn)?;

        *task = Some(Task { shutdown, handle });
        info!(target: "pool", "Pool started ({:?})", self.shared.path);

        Ok(())
    }

    /// Stop the snapshot task, after a final snapshot is written.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();

        let Some(Task { shutdown, handle }) = task else {
            debug!(target: "pool", "Pool is not running");
            return;
        };
        // The task may have exited on its own; joining tells us how.
        shutdown.send(()).ok();

        if handle.join().is_err() {
            error!(target: "pool", "Snapshot task panicked");
        }
        info!(target: "pool", "Pool stopped");
    }

    /// Whether the snapshot task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Write a snapshot now.
    pub fn save(&self) -> Result<(), Error> {
        self.shared.save()
    }

    /// Replace the pool contents with the peers file. If the file can't be read
    /// back, it is removed, the pool is reset, and the error is returned.
    ///
    /// The file is read and decoded before the pool is locked.
    pub fn load(&self) -> Result<(), Error> {
        let path = &self.shared.path;
        let cfg = addrmgr::Config {
            local_subnetwork: self.config.local_subnetwork,
        };
        let _file = self.shared.file();

        match peers::load(path, cfg, self.clock.clone()) {
            Ok(Some(restored)) => {
                *self.shared.addrmgr() = restored;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                error!(target: "pool", "Failed to load peers from {:?}: {}", path, err);

                self.reset();
                peers::discard(path);

                Err(err)
            }
        }
    }

    /// The secret keying bucket placement.
    pub fn secret(&self) -> [u8; 32] {
        *self.shared.addrmgr().secret()
    }

    /// Forget all addresses, and start over with a fresh secret.
    pub fn reset(&self) {
        self.shared
            .addrmgr()
            .reset(AddressManager::<C>::generate_secret());
    }

    /// Add addresses heard about from a peer. Returns the number of addresses added.
    pub fn observe_many(
        &self,
        addrs: impl IntoIterator<Item = NetAddr>,
        source: &NetAddr,
        subnetwork: Option<SubnetworkId>,
    ) -> usize {
        self.shared
            .addrmgr()
            .observe_many(addrs, source, subnetwork)
    }

    /// Add a single address heard about from a peer.
    pub fn observe_one(
        &self,
        addr: NetAddr,
        source: &NetAddr,
        subnetwork: Option<SubnetworkId>,
    ) -> bool {
        self.shared.addrmgr().observe(addr, source, subnetwork)
    }

    /// Add an address given as `host:port`. Host names are resolved.
    pub fn observe_by_string(
        &self,
        addr: &str,
        source: &NetAddr,
        services: ServiceFlags,
        subnetwork: Option<SubnetworkId>,
    ) -> Result<bool, Error> {
        let (host, port) = address::split_host_port(addr)?;
        let now = self.clock.local_time();
        let addr = address::host_to_net_addr(host, port, services, now, &*self.lookup)?;

        Ok(self.observe_one(addr, source, subnetwork))
    }

    /// Look up a known address.
    pub fn get(&self, addr: &NetAddr) -> Option<KnownAddress> {
        self.shared.addrmgr().get(addr).cloned()
    }

    /// Pick an address to connect to. The address is withheld from further selection
    /// until it is reported on with [`Pool::record_attempt`] or [`Pool::record_success`].
    pub fn select_one(&self) -> Option<KnownAddress> {
        self.shared.addrmgr().select_one()
    }

    /// Report a connection attempt.
    pub fn record_attempt(&self, addr: &NetAddr) {
        self.shared.addrmgr().record_attempt(addr)
    }

    /// Report a completed handshake, with the subnetwork the peer serves.
    pub fn record_success(&self, addr: &NetAddr, subnetwork: Option<SubnetworkId>) {
        self.shared.addrmgr().record_success(addr, subnetwork)
    }

    /// Report a live connection.
    pub fn mark_connected(&self, addr: &NetAddr) {
        self.shared.addrmgr().mark_connected(addr)
    }

    /// Addresses to share with a peer.
    pub fn snapshot_candidates(
        &self,
        include_all_subnetworks: bool,
        subnetwork: Option<&SubnetworkId>,
    ) -> Vec<NetAddr> {
        self.shared
            .addrmgr()
            .snapshot_candidates(include_all_subnetworks, subnetwork)
    }

    /// Whether we should ask peers for more addresses.
    pub fn need_more(&self) -> bool {
        self.shared.addrmgr().need_more()
    }

    /// Number of known addresses.
    pub fn total_count(&self) -> usize {
        self.shared.addrmgr().len()
    }

    /// Number of *new* addresses of a subnetwork.
    pub fn new_count(&self, subnetwork: Option<&SubnetworkId>) -> usize {
        self.shared.addrmgr().new_count(subnetwork)
    }

    /// Number of *tried* addresses of a subnetwork.
    pub fn tried_count(&self, subnetwork: Option<&SubnetworkId>) -> usize {
        self.shared.addrmgr().tried_count(subnetwork)
    }

    /// Register one of our own addresses.
    pub fn register_local(&self, addr: NetAddr, priority: Priority) -> Result<(), Error> {
        self.locals().register(addr, priority)?;

        Ok(())
    }

    /// Our address to advertise to `remote`.
    pub fn best_local_for(&self, remote: &NetAddr) -> NetAddr {
        self.locals().best_for(remote)
    }

    /// Our registered addresses.
    pub fn local_addresses(&self) -> Vec<LocalAddress> {
        self.locals().iter().cloned().collect()
    }

    /// Whether the address is one of ours.
    pub fn has_local_address(&self, addr: &NetAddr) -> bool {
        self.locals().contains(addr)
    }

    fn locals(&self) -> MutexGuard<'_, LocalAddresses> {
        self.locals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Clock> Drop for Pool<C> {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Snapshot task. Saves on every tick, and once more on shutdown.
fn run<C: Clock>(shared: Arc<Shared<C>>, interval: LocalDuration, shutdown: chan::Receiver<()>) {
    let ticker = chan::tick(interval.into());

    loop {
        chan::select! {
            recv(ticker) -> _ => {
                if let Err(err) = shared.save() {
                    warn!(target: "pool", "Failed to save snapshot: {}", err);
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    if let Err(err) = shared.save() {
        error!(target: "pool", "Failed to save final snapshot: {}", err);
    }
    debug!(target: "pool", "Snapshot task exited");
}
