//! Per-application deployment lock

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::errors::DeployError;

/// An exclusive advisory lock held for the duration of one run.
///
/// The lock is released when the guard is dropped or the process exits, so a
/// crashed run never leaves a stale lock behind.
#[derive(Debug)]
pub struct DeployLock {
    file: std::fs::File,
    path: PathBuf,
}

impl DeployLock {
    /// Try to take the lock without blocking
    pub fn acquire(path: &Path) -> Result<Self, DeployError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| DeployError::Locked(path.display().to_string()))?;

        debug!("Acquired deploy lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released deploy lock {}", self.path.display());
    }
}
