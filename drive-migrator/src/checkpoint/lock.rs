//! Cross-process exclusive lock backed by a sentinel file.
//!
//! Acquisition creates the sentinel with create-new semantics; if it already
//! exists the caller sleeps and retries until the timeout elapses. The
//! sentinel holds the owner's pid so a stuck lock can be traced to a process.
//! There is no fairness between waiters and the lock is not reentrant.

use crate::utils::{MigratorError, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between acquisition attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lock settings for one sentinel path
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
}

/// Held lock; the sentinel is removed when this is dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the timeout elapses.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let start = Instant::now();

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    if let Err(e) = write!(file, "{}", std::process::id()) {
                        let _ = std::fs::remove_file(&self.path);
                        return Err(e.into());
                    }
                    debug!("Acquired lock {}", self.path.display());
                    return Ok(FileLockGuard {
                        path: self.path.clone(),
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() > self.timeout {
                        let owner = self.owner();
                        warn!("Timed out waiting for lock {} ({})", self.path.display(), owner);
                        return Err(MigratorError::LockTimeout {
                            path: self.path.clone(),
                            owner,
                        });
                    }
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Describe the current holder from the sentinel contents
    fn owner(&self) -> String {
        match std::fs::read_to_string(&self.path) {
            Ok(pid) if !pid.trim().is_empty() => format!("pid {}", pid.trim()),
            _ => "unknown owner".to_string(),
        }
    }
}

/// Pid recorded in a sentinel that is currently present
pub fn sentinel_owner(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|pid| pid.trim().to_string())
        .filter(|pid| !pid.is_empty())
}

impl FileLockGuard {
    /// Release explicitly; equivalent to dropping the guard
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}
