//! Single-instance lock file
//!
//! An advisory exclusive lock on a file; only one process can hold it at a
//! time. The file itself is left on disk after release.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::FileExt;
use tracing::{debug, warn};

use crate::errors::StagehandError;

pub struct Lockfile {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl Lockfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> Result<File, StagehandError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(file)
    }

    fn is_held(&self) -> bool {
        self.held
            .lock()
            .map(|held| held.is_some())
            .unwrap_or_else(|poisoned| poisoned.into_inner().is_some())
    }

    /// Whether the lock is currently held, by this or another process
    pub fn exists(&self) -> Result<bool, StagehandError> {
        if self.is_held() {
            return Ok(true);
        }

        let file = Self::open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.unlock()?;
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lock is acquired. Acquiring twice is a no-op.
    pub async fn wait(&self) -> Result<(), StagehandError> {
        if self.is_held() {
            return Ok(());
        }

        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<File, StagehandError> {
            let file = Self::open(&path)?;
            file.lock_exclusive()
                .map_err(|e| StagehandError::Lock(format!("{}: {}", path.display(), e)))?;
            Ok(file)
        })
        .await
        .map_err(|e| StagehandError::Lock(e.to_string()))??;

        debug!("Acquired lock {}", self.path.display());
        match self.held.lock() {
            Ok(mut held) => *held = Some(file),
            Err(poisoned) => *poisoned.into_inner() = Some(file),
        }
        Ok(())
    }

    /// Release the lock. Safe to call any number of times, including from a
    /// signal handler.
    pub fn release(&self) {
        let file = match self.held.lock() {
            Ok(mut held) => held.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(file) = file {
            if let Err(e) = file.unlock() {
                warn!("Failed to unlock {}: {}", self.path.display(), e);
            }
            debug!("Released lock {}", self.path.display());
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        self.release();
    }
}
