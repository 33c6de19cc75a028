//! Crash-safe filesystem primitives.

use std::fs;
use std::io;
use std::path::Path;

/// Atomically rename a file and fsync the parent directory.
///
/// `rename()` is atomic at the filesystem level, but the directory entry
/// update may only live in the kernel's page cache until the directory
/// itself is fsynced. Bucket files are renamed into place with this so a
/// bucket whose hash has been published can never vanish after a power
/// loss.
///
/// # Errors
///
/// Returns an error if the rename fails or the parent directory cannot
/// be opened or fsynced.
pub fn durable_rename(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)?;

    if let Some(parent) = to.parent() {
        let dir = fs::File::open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}
