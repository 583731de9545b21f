//! One transfer process run: state housekeeping, crawling, checkpoint
//! rebuild and the transfer itself.

use crate::checkpoint::{self, lock::FileLock, rebuild_from_destination, CheckpointStore};
use crate::config::Config;
use crate::crawl::{load_cache, load_or_crawl};
use crate::drive::RemoteDrive;
use crate::executor::{TransferExecutor, TransferOptions, TransferSummary};
use crate::progress_log::{self, TransferLog};
use crate::target::FileTarget;
use crate::utils::{MigratorError, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Use caches; rebuild the checkpoint only if it is missing
    Normal,
    /// Clear state, re-crawl and rebuild the checkpoint, no transfer
    Reset,
    /// `Reset`, then transfer
    FullRebuild,
}

/// Files of the cached source crawl that are not checkpointed yet.
///
/// `None` when there is no source cache to compare against.
pub fn outstanding_work(source_cache: &Path, checkpoint_path: &Path) -> Result<Option<usize>> {
    let Some(source) = load_cache(source_cache)? else {
        return Ok(None);
    };
    let entries = checkpoint::load(checkpoint_path)?;
    Ok(Some(checkpoint::filter_pending(&source, &entries).len()))
}

pub struct MigrationRunner {
    config: Config,
    source: Arc<dyn RemoteDrive>,
    destination: Arc<dyn RemoteDrive>,
    log: Arc<dyn TransferLog>,
    cancel_token: CancellationToken,
}

impl MigrationRunner {
    pub fn new(
        config: Config,
        source: Arc<dyn RemoteDrive>,
        destination: Arc<dyn RemoteDrive>,
        log: Arc<dyn TransferLog>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            log,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(
            &self.config.paths.checkpoint,
            FileLock::new(self.config.checkpoint_lock(), self.config.transfer.lock_timeout()),
        )
    }

    /// Compare the stored fingerprint with the current one.
    ///
    /// The first run stores the fingerprint and reports no change.
    pub fn config_changed(&self) -> Result<bool> {
        let path = &self.config.paths.config_hash;
        let current = self.config.fingerprint();

        match fs::read_to_string(path) {
            Ok(saved) => {
                let changed = saved.trim() != current;
                if changed {
                    info!("Source or destination settings changed since the last run");
                }
                Ok(changed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.store_fingerprint()?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn store_fingerprint(&self) -> Result<()> {
        let path = &self.config.paths.config_hash;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.config.fingerprint())?;
        Ok(())
    }

    /// Remove crawl caches, the checkpoint and the progress log, and store
    /// the current fingerprint
    pub fn reset_state(&self) -> Result<()> {
        info!("Clearing caches, checkpoint and progress log");
        let paths = &self.config.paths;
        for cache in [&paths.source_cache, &paths.destination_cache] {
            match fs::remove_file(cache) {
                Ok(()) => info!("Removed {}", cache.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        checkpoint::clear(&paths.checkpoint)?;
        progress_log::clear(&paths.progress_log, self.config.log.progress_log_backups)?;
        self.store_fingerprint()
    }

    async fn source_targets(&self, force_crawl: bool) -> Result<Vec<FileTarget>> {
        load_or_crawl(
            self.source.as_ref(),
            &self.config.source.root,
            &self.config.paths.source_cache,
            force_crawl,
        )
        .await
    }

    /// Rebuild the checkpoint from what already exists on the destination.
    ///
    /// Returns the number of source files still to be copied.
    pub async fn rebuild_checkpoint(
        &self,
        source: Option<&[FileTarget]>,
        force_crawl: bool,
        verbose: bool,
    ) -> Result<usize> {
        let owned;
        let source = match source {
            Some(targets) => targets,
            None => {
                owned = self.source_targets(force_crawl).await?;
                &owned
            }
        };

        let destination = load_or_crawl(
            self.destination.as_ref(),
            &self.config.destination.root,
            &self.config.paths.destination_cache,
            force_crawl,
        )
        .await?;

        let rebuilt = rebuild_from_destination(source, &destination);
        let store = self.checkpoint_store();
        let entries = rebuilt.clone();
        tokio::task::spawn_blocking(move || store.replace(&entries))
            .await
            .map_err(|e| MigratorError::Transfer(format!("checkpoint task failed: {}", e)))??;

        if verbose {
            for entry in &rebuilt {
                info!("Already migrated: {}", entry.relative_path);
            }
        }

        let pending = source.len() - rebuilt.len();
        info!(
            "Checkpoint rebuilt: {} source files, {} on destination, {} migrated, {} pending",
            source.len(),
            destination.len(),
            rebuilt.len(),
            pending
        );
        Ok(pending)
    }

    /// Run the `transfer` command in the given mode
    pub async fn run(&self, mode: TransferMode, verbose: bool) -> Result<Option<TransferSummary>> {
        let changed = self.config_changed()?;
        let rebuild = mode != TransferMode::Normal || changed;

        let source = if rebuild {
            if changed && mode == TransferMode::Normal {
                info!("Settings changed, performing a full rebuild");
            }
            self.reset_state()?;
            let source = self.source_targets(true).await?;
            self.rebuild_checkpoint(Some(&source), true, verbose).await?;

            if mode == TransferMode::Reset {
                info!("Reset complete, no files transferred");
                return Ok(None);
            }
            source
        } else {
            let source = self.source_targets(false).await?;
            if !self.config.paths.checkpoint.exists() {
                info!("No checkpoint found, rebuilding it from the destination");
                self.rebuild_checkpoint(Some(&source), false, verbose).await?;
            }
            source
        };

        let executor = TransferExecutor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.destination),
            self.checkpoint_store(),
            Arc::clone(&self.log),
            TransferOptions::from_config(&self.config),
        )
        .with_cancel(self.cancel_token.clone());

        let summary = executor.execute(source).await?;
        Ok(Some(summary))
    }
}
