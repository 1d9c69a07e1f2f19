//! Single-instance guard for a slot directory.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::{AppError, Result};

/// Exclusive advisory lock held for the life of the process.
#[derive(Debug)]
pub struct InstanceLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _guard: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock, retrying once after `retry_wait` if it is held.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the second attempt also fails.
    pub fn acquire(path: impl AsRef<Path>, retry_wait: Duration) -> Result<Self> {
        let path = path.as_ref();
        match Self::try_acquire(path) {
            Ok(lock) => Ok(lock),
            Err(err) => {
                warn!(path = %path.display(), %err, ?retry_wait, "lock busy; retrying once");
                thread::sleep(retry_wait);
                Self::try_acquire(path)
            }
        }
    }

    /// Single non-blocking attempt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the file cannot be opened or is locked.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|err| AppError::Lock(format!("cannot open {}: {err}", path.display())))?;

        #[cfg(unix)]
        let guard = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| {
                AppError::Lock(format!("{} is held: {}", path.display(), errno.desc()))
            })?;
        #[cfg(not(unix))]
        let guard = file;

        info!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            _guard: guard,
            path: path.to_path_buf(),
        })
    }

    /// Locked file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
