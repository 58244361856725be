//! Single-instance process lock
//!
//! Cron can fire a new run while a slow cycle (a stalled FTP transfer, a
//! device still settling) is in flight; overlapping runs would race on the
//! checkpoint and quarantine files. An advisory write lock on a well-known
//! file keeps at most one client per data directory.

use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Lock acquisition errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock file could not be opened or created
    #[error("failed to open lock file {path}: {message}")]
    Open {
        /// Path that was attempted
        path: String,
        /// Underlying I/O error
        message: String,
    },

    /// Another instance holds the lock
    #[error("another client instance is already running (lock {path} is held)")]
    Held {
        /// Path of the contested lock file
        path: String,
    },
}

/// Advisory lock on the client's data directory.
///
/// The write guard returned by [`try_acquire`] must be kept alive for the
/// whole run; dropping it releases the lock.
///
/// [`try_acquire`]: InstanceLock::try_acquire
pub struct InstanceLock {
    lock: RwLock<File>,
    path: String,
}

impl InstanceLock {
    /// Open (creating if needed) the lock file.
    pub fn open(path: &Path) -> Result<Self, LockError> {
        let open_err = |e: std::io::Error| LockError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(open_err)?;

        Ok(Self {
            lock: RwLock::new(file),
            path: path.display().to_string(),
        })
    }

    /// Try to take the exclusive lock without blocking, recording our pid
    /// in the file for operators.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>, LockError> {
        let path = self.path.clone();
        let mut guard = self
            .lock
            .try_write()
            .map_err(|_| LockError::Held { path: path.clone() })?;

        let pid = std::process::id();
        guard.set_len(0).map_err(|e| LockError::Open {
            path: path.clone(),
            message: e.to_string(),
        })?;
        writeln!(&mut *guard, "{pid}").map_err(|e| LockError::Open {
            path,
            message: e.to_string(),
        })?;

        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.pid");
        let mut lock = InstanceLock::open(&path).unwrap();
        let _guard = lock.try_acquire().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.pid");
        let mut first = InstanceLock::open(&path).unwrap();
        let _guard = first.try_acquire().unwrap();

        let mut second = InstanceLock::open(&path).unwrap();
        assert!(matches!(
            second.try_acquire().unwrap_err(),
            LockError::Held { .. }
        ));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.pid");
        {
            let mut first = InstanceLock::open(&path).unwrap();
            let _guard = first.try_acquire().unwrap();
        }
        let mut second = InstanceLock::open(&path).unwrap();
        assert!(second.try_acquire().is_ok());
    }
}
