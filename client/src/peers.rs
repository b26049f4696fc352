//! The `peers.json` file.
use std::path::Path;
use std::{fs, io};

use log::*;
use microserde::json::Value;

use peerpool_common::io::write_atomic;
use peerpool_common::Clock;
use peerpool_p2p as p2p;
use peerpool_p2p::addrmgr;
use peerpool_p2p::AddressManager;

use crate::error::Error;

/// Name of the peers file, under the data directory.
pub const FILE_NAME: &str = "peers.json";

/// Read an address manager back from a peers file.
///
/// Returns `None` if there was no file to load. Nothing is modified on error:
/// see [`discard`] to get rid of a file that can't be read back.
pub fn load<C: Clock>(
    path: &Path,
    cfg: addrmgr::Config,
    clock: C,
) -> Result<Option<AddressManager<C>>, Error> {
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(target: "pool", "No peers file found at {:?}", path);
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let value = microserde::json::from_str::<Value>(&s).map_err(p2p::Error::from)?;
    let addrmgr = AddressManager::from_json(cfg, &value, clock)?;

    info!(
        target: "pool",
        "Loaded {} address(es) from {:?}",
        addrmgr.len(),
        path
    );
    Ok(Some(addrmgr))
}

/// Remove a peers file that couldn't be read back.
pub fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(target: "pool", "Removed {:?}", path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(target: "pool", "Failed to remove {:?}: {}", path, err),
    }
}

/// Write a snapshot to the peers file, replacing it atomically.
pub fn save(path: &Path, snapshot: &Value) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let s = microserde::json::to_string(snapshot);
    write_atomic(path, s.as_bytes())?;

    debug!(target: "pool", "Saved {} byte(s) to {:?}", s.len(), path);

    Ok(())
}
