//! Filesystem-based locking for cross-process coordination
//!
//! Only one process may synchronize a given index at a time. The lock is an
//! `flock()` on `<index>/sync.lock`; the OS releases it if the holder dies.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Guard that holds an exclusive filesystem lock
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct FsLockGuard {
    _file: File,
    path: PathBuf,
}

impl FsLockGuard {
    /// Try to acquire the lock without waiting
    ///
    /// Returns:
    /// - `Ok(Some(guard))` if the lock was acquired
    /// - `Ok(None)` if another holder has it
    /// - `Err(...)` on IO errors
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired sync lock {:?}", lock_path);
                Ok(Some(Self {
                    _file: file,
                    path: lock_path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("Sync lock {:?} is held by another writer", lock_path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll for the lock until it is acquired or `timeout` expires
    pub fn acquire_blocking(lock_path: &Path, timeout: Duration) -> io::Result<Option<Self>> {
        let start = Instant::now();
        let mut announced = false;

        loop {
            if let Some(guard) = Self::try_acquire(lock_path)? {
                if announced {
                    tracing::info!("Acquired sync lock after {:?}", start.elapsed());
                }
                return Ok(Some(guard));
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Timeout waiting for sync lock {:?} after {:?}",
                    lock_path,
                    timeout
                );
                return Ok(None);
            }
            if !announced {
                tracing::info!(
                    "Waiting for sync lock {:?} (timeout: {:?})",
                    lock_path,
                    timeout
                );
                announced = true;
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FsLockGuard {
    fn drop(&mut self) {
        // closing the file releases the flock; the file itself is reused
        tracing::debug!("Releasing sync lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index").join("sync.lock");

        let guard = FsLockGuard::try_acquire(&path).unwrap();
        assert!(guard.is_some());
        assert!(path.exists());
        drop(guard);

        let guard2 = FsLockGuard::try_acquire(&path).unwrap();
        assert!(guard2.is_some());
    }

    #[test]
    fn test_concurrent_lock_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");

        let guard1 = FsLockGuard::try_acquire(&path).unwrap();
        assert!(guard1.is_some());

        let path_clone = path.clone();
        let handle = thread::spawn(move || FsLockGuard::try_acquire(&path_clone).unwrap());
        assert!(handle.join().unwrap().is_none(), "Second lock should fail");

        drop(guard1);
        assert!(FsLockGuard::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_blocking_acquire_with_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");
        let _guard = FsLockGuard::try_acquire(&path).unwrap().unwrap();

        let path_clone = path.clone();
        let handle = thread::spawn(move || {
            FsLockGuard::acquire_blocking(&path_clone, Duration::from_millis(150)).unwrap()
        });
        assert!(handle.join().unwrap().is_none(), "Should time out waiting");
    }

    #[test]
    fn test_blocking_acquire_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");
        let guard = FsLockGuard::try_acquire(&path).unwrap().unwrap();

        let path_clone = path.clone();
        let handle = thread::spawn(move || {
            FsLockGuard::acquire_blocking(&path_clone, Duration::from_secs(5)).unwrap()
        });
        thread::sleep(Duration::from_millis(200));
        drop(guard);

        let acquired = handle.join().unwrap();
        assert!(acquired.is_some());
    }
}
