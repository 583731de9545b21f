//! Read-through JSON cache of crawl results.

use super::walker::crawl;
use crate::drive::RemoteDrive;
use crate::target::FileTarget;
use crate::utils::Result;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Cached targets, `None` when no cache file exists
pub fn load_cache(path: &Path) -> Result<Option<Vec<FileTarget>>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn save_cache(targets: &[FileTarget], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(targets)?)?;
    info!("Saved {} file entries to {}", targets.len(), path.display());
    Ok(())
}

/// Return the cached crawl of `root`, crawling (and caching) when there is
/// no usable cache or `force` is set.
pub async fn load_or_crawl(
    drive: &dyn RemoteDrive,
    root: &str,
    cache_path: &Path,
    force: bool,
) -> Result<Vec<FileTarget>> {
    if !force {
        match load_cache(cache_path) {
            Ok(Some(targets)) => {
                info!("Loaded {} file entries from {}", targets.len(), cache_path.display());
                return Ok(targets);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable cache {}: {}", cache_path.display(), e),
        }
    }

    let targets = crawl(drive, root).await;
    save_cache(&targets, cache_path)?;
    Ok(targets)
}
