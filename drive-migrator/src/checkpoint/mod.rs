//! Durable record of files already copied to the destination.
//!
//! The checkpoint is a single JSON array of [`FileTarget`]s. Every insert
//! rewrites the whole array while holding the sentinel [`FileLock`], so
//! concurrent workers and restarted processes never lose or duplicate an
//! entry. The cost is O(n) per insert.

pub mod lock;
pub mod rebuild;

use crate::target::FileTarget;
use crate::utils::Result;
use lock::FileLock;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use rebuild::rebuild_from_destination;

/// Load checkpoint entries; a missing file is an empty checkpoint.
///
/// A file that exists but does not parse is an error, never an empty list:
/// treating it as empty would re-migrate everything.
pub fn load(path: &Path) -> Result<Vec<FileTarget>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let entries: Vec<FileTarget> = serde_json::from_str(&content)?;
    Ok(entries)
}

/// Serialize the full list, replacing the previous file atomically.
pub fn save(entries: &[FileTarget], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(entries)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// True iff an entry has the same `(relative_path, name)` as `target`
pub fn is_migrated(target: &FileTarget, entries: &[FileTarget]) -> bool {
    entries.iter().any(|entry| entry.same_identity(target))
}

/// Targets that still need to be copied
pub fn filter_pending(targets: &[FileTarget], entries: &[FileTarget]) -> Vec<FileTarget> {
    let done: HashSet<(&str, &str)> = entries.iter().map(|e| e.identity()).collect();
    targets
        .iter()
        .filter(|t| !done.contains(&t.identity()))
        .cloned()
        .collect()
}

/// Record `target` as migrated. Idempotent.
///
/// Returns `true` if the entry was added, `false` if it was already present.
pub fn append(target: &FileTarget, path: &Path, lock: &FileLock) -> Result<bool> {
    let _guard = lock.acquire()?;

    let mut entries = load(path)?;
    if is_migrated(target, &entries) {
        debug!("Already checkpointed: {}", target.relative_path);
        return Ok(false);
    }

    entries.push(target.clone());
    save(&entries, path)?;
    Ok(true)
}

/// Delete the checkpoint (full reset)
pub fn clear(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("Removed checkpoint {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Checkpoint file plus its lock, shared by every transfer worker
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    lock: FileLock,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, lock: FileLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<FileTarget>> {
        load(&self.path)
    }

    pub fn append(&self, target: &FileTarget) -> Result<bool> {
        append(target, &self.path, &self.lock)
    }

    /// Replace the whole checkpoint under the lock
    pub fn replace(&self, entries: &[FileTarget]) -> Result<()> {
        let _guard = self.lock.acquire()?;
        save(entries, &self.path)
    }

    pub fn clear(&self) -> Result<()> {
        clear(&self.path)
    }
}
