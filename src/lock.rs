//! Cross-process pool lock.
//!
//! Every pool store read or write happens while holding an exclusive
//! `flock(2)` on the pool lock file. The lock is advisory: all vmpool
//! invocations cooperate, nothing stops a process that bypasses it.

use crate::error::{Error, Result};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Handle to the pool lock file.
#[derive(Debug, Clone)]
pub struct PoolLock {
    path: PathBuf,
}

impl PoolLock {
    /// Create a handle for the lock file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the lock file if it does not exist yet.
    ///
    /// Only pool generation creates the lock file; everything else treats a
    /// missing lock file as an uninitialized pool.
    pub fn create(&self) -> Result<()> {
        std::fs::write(
            &self.path,
            "used for locking access to the vm pool store\n",
        )
        .map_err(|e| Error::Lock {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Block until the exclusive lock is held.
    ///
    /// The returned guard releases the lock when dropped.
    pub fn acquire(&self) -> Result<PoolLockGuard> {
        let file = File::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PoolNotInitialized(self.path.clone())
            } else {
                Error::Lock {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Lock {
                path: self.path.clone(),
                reason: err.to_string(),
            });
        }

        tracing::trace!(path = %self.path.display(), "pool lock acquired");
        Ok(PoolLockGuard {
            file,
            path: self.path.clone(),
        })
    }
}

/// Held pool lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct PoolLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for PoolLockGuard {
    fn drop(&mut self) {
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } != 0 {
            tracing::warn!(
                path = %self.path.display(),
                error = %std::io::Error::last_os_error(),
                "failed to release pool lock"
            );
        }
        tracing::trace!(path = %self.path.display(), "pool lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_missing_lock_file_means_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PoolLock::new(dir.path().join("ips.lock"));
        assert!(matches!(lock.acquire(), Err(Error::PoolNotInitialized(_))));
    }

    #[test]
    fn test_lock_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PoolLock::new(dir.path().join("ips.lock"));
        lock.create().unwrap();

        let guard = lock.acquire().unwrap();

        // A second open file description must block until the guard drops.
        let (tx, rx) = mpsc::channel();
        let other = lock.clone();
        let handle = std::thread::spawn(move || {
            let _guard = other.acquire().unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PoolLock::new(dir.path().join("ips.lock"));
        lock.create().unwrap();

        fn fails(lock: &PoolLock) -> Result<()> {
            let _guard = lock.acquire()?;
            Err(Error::NoFreeSlots)
        }
        assert!(fails(&lock).is_err());

        // Would deadlock if the early return leaked the lock
        let _guard = lock.acquire().unwrap();
    }
}
