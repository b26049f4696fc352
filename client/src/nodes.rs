//! The `nodes.json` file of a DNS seeder.
use std::path::Path;
use std::{fs, io};

use log::*;
use microserde::json::Value;

use peerpool_common::io::write_atomic;
use peerpool_common::Clock;
use peerpool_p2p as p2p;
use peerpool_p2p::Seeder;

use crate::error::Error;

/// Name of the nodes file, under the data directory.
pub const FILE_NAME: &str = "nodes.json";

/// Restore a seeder's node table. Returns `false` if there was no file to load.
pub fn load<C: Clock>(path: &Path, seeder: &mut Seeder<C>) -> Result<bool, Error> {
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let value = microserde::json::from_str::<Value>(&s).map_err(p2p::Error::from)?;
    seeder.restore(&value)?;

    info!(target: "seeder", "Loaded {} node(s) from {:?}", seeder.len(), path);

    Ok(true)
}

/// Write a seeder's node table, replacing the file atomically.
pub fn save<C: Clock>(path: &Path, seeder: &Seeder<C>) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let s = microserde::json::to_string(&seeder.to_json());

    write_atomic(path, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpool_common::ServiceFlags;
    use peerpool_test::{addr, EPOCH, PORT};

    #[test]
    fn test_save_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seeder").join(FILE_NAME);
        let mut seeder = Seeder::new(PORT, EPOCH);

        assert!(!load(&path, &mut seeder).unwrap());

        seeder.add_addresses([addr([45, 1, 1, 1], PORT), addr([45, 1, 1, 2], PORT)]);
        seeder.good(&addr([45, 1, 1, 1], PORT), ServiceFlags::NETWORK, None);
        save(&path, &seeder).unwrap();

        let mut restored = Seeder::new(PORT, EPOCH);
        assert!(load(&path, &mut restored).unwrap());
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_load_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(FILE_NAME);
        let mut seeder = Seeder::new(PORT, EPOCH);

        fs::write(&path, b"{\"version\":").unwrap();

        assert!(matches!(
            load(&path, &mut seeder),
            Err(Error::P2p(p2p::Error::Parse(_)))
        ));
    }
}
