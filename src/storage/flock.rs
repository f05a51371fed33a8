use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Exclusive advisory lock on a file, held until the guard is dropped.
///
/// The file is only a lock handle; its contents are never read.
#[derive(Debug)]
pub struct ExclusiveFileLock {
    file: File,
    path: PathBuf,
}

impl ExclusiveFileLock {
    /// Open (creating if needed) and lock `path`, blocking until the lock is granted
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        file.lock_exclusive().map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to acquire file lock {}: {}", path.display(), e),
            )
        })?;

        tracing::debug!("Acquired lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ExclusiveFileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        } else {
            tracing::debug!("Released lock {}", self.path.display());
        }
    }
}
