//! A lock shared between processes through the filesystem.
//!
//! Holding the lock means having created its directory. Directory creation
//! is atomic on every filesystem we care about, so exactly one contender
//! wins. There is no owner liveness check: a lock left behind by a dead
//! process stays until someone decides it is stale and breaks it.
//!
//! ```
//! use oxidec_do::DistributedLock;
//! use std::time::Duration;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let lock = DistributedLock::new(dir.path().join("jobs.lock"));
//! assert!(lock.try_lock().unwrap());
//! assert!(!lock.is_stale(Duration::from_secs(60)));
//! lock.unlock().unwrap();
//! ```

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A named, filesystem-backed mutual exclusion lock.
#[derive(Debug)]
pub struct DistributedLock {
    path: PathBuf,
    /// Modification time of the directory we created, while held.
    held: Mutex<Option<SystemTime>>,
}

impl DistributedLock {
    /// A lock at `path`. Nothing is touched until [`DistributedLock::try_lock`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        DistributedLock {
            path: path.as_ref().to_path_buf(),
            held: Mutex::new(None),
        }
    }

    /// The lock path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Tries to take the lock without blocking; `false` if someone holds
    /// it.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the directory cannot be created for another reason.
    pub fn try_lock(&self) -> Result<bool> {
        let mut held = self.held.lock();
        match fs::create_dir(&self.path) {
            Ok(()) => {
                let created = fs::metadata(&self.path)?.modified()?;
                *held = Some(created);
                oxidex_log::debug!("locked {}", self.path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Releases a lock this instance holds.
    ///
    /// # Errors
    ///
    /// [`Error::LockNotHeld`] if this instance does not hold it, including
    /// when it was broken (and perhaps retaken) by someone else.
    pub fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock();
        let not_held = || Error::LockNotHeld {
            path: self.path.display().to_string(),
        };
        let ours = held.take().ok_or_else(not_held)?;
        let current = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_held()),
            Err(err) => return Err(err.into()),
        };
        if current != ours {
            return Err(not_held());
        }
        fs::remove_dir_all(&self.path)?;
        oxidex_log::debug!("unlocked {}", self.path.display());
        Ok(())
    }

    /// Removes the lock whoever holds it.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the directory exists but cannot be removed.
    pub fn break_lock(&self) -> Result<()> {
        self.held.lock().take();
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                oxidex_log::warn!("broke lock {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// When the lock was taken, by anyone; `None` if it is free.
    #[must_use]
    pub fn lock_date(&self) -> Option<SystemTime> {
        if let Some(date) = *self.held.lock() {
            return Some(date);
        }
        fs::metadata(&self.path).and_then(|meta| meta.modified()).ok()
    }

    /// Whether the lock is held and was taken more than `window` ago.
    #[must_use]
    pub fn is_stale(&self, window: Duration) -> bool {
        self.lock_date()
            .and_then(|date| date.elapsed().ok())
            .is_some_and(|age| age > window)
    }
}
