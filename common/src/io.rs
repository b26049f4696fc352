//! File I/O helpers.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Path of the temporary file used when writing `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");

    PathBuf::from(name)
}

/// Write `data` to `path` so that a crash never leaves a partially written file behind.
///
/// The data is written and synced to a sibling file with a `.new` suffix, which is
/// then renamed over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let staging = staging_path(path);
    {
        let mut file = fs::File::create(&staging)?;

        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&staging, path)
}
