//! Transfer watchdog.
//!
//! Runs the transfer as a child process and restarts it when it stops making
//! progress or exits while files are still outstanding. The only signals
//! from the child are its exit status and the progress log's mtime.
//!
//! ```text
//! Starting -> Running -> Frozen ---------> Restarting -> Starting
//!                     -> Exited -> work left? -^
//!                               -> done -> Complete
//! any state -> (operator interrupt) -> Terminating
//! ```

use super::child::{ChildExit, ChildLauncher, SupervisedChild};
use crate::checkpoint::lock::sentinel_owner;
use crate::config::WatchdogConfig;
use crate::progress_log;
use crate::runner::outstanding_work;
use crate::utils::{MigratorError, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the watchdog can observe about the migration
pub trait WorkProbe: Send + Sync {
    /// Modification time of the progress log
    fn progress_mtime(&self) -> Option<SystemTime>;

    /// Files not yet migrated, `None` when unknown
    fn outstanding_work(&self) -> Result<Option<usize>>;

    /// Last `n` progress log lines
    fn tail(&self, n: usize) -> Vec<String>;

    /// Pid recorded in the checkpoint lock sentinel, if one is present
    fn lock_owner(&self) -> Option<String>;
}

/// Probe backed by the migration's state files
#[derive(Debug, Clone)]
pub struct FileProbe {
    pub progress_log: PathBuf,
    pub source_cache: PathBuf,
    pub checkpoint: PathBuf,
    pub checkpoint_lock: PathBuf,
}

impl WorkProbe for FileProbe {
    fn progress_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.progress_log)
            .and_then(|m| m.modified())
            .ok()
    }

    fn outstanding_work(&self) -> Result<Option<usize>> {
        outstanding_work(&self.source_cache, &self.checkpoint)
    }

    fn tail(&self, n: usize) -> Vec<String> {
        progress_log::tail(&self.progress_log, n)
    }

    fn lock_owner(&self) -> Option<String> {
        sentinel_owner(&self.checkpoint_lock)
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub min_run: Duration,
    pub restart_delay: Duration,
    pub tail_lines: usize,
    pub max_restarts: Option<u32>,
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            idle_timeout: config.idle_timeout(),
            grace_period: config.grace_period(),
            min_run: config.min_run(),
            restart_delay: config.restart_delay(),
            tail_lines: config.tail_lines,
            max_restarts: config.max_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No outstanding work after the child exited
    Complete { restarts: u32 },
    /// Stopped by the operator
    Terminated { restarts: u32 },
}

/// Per-run bookkeeping; lives only in memory
#[derive(Debug, Clone)]
pub struct WatchdogState {
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    pub restart_count: u32,
    last_mtime: Option<SystemTime>,
}

impl WatchdogState {
    fn new(restart_count: u32, mtime: Option<SystemTime>) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_heartbeat: now,
            restart_count,
            last_mtime: mtime,
        }
    }

    /// Record a heartbeat if the progress log changed since the last poll
    fn observe(&mut self, mtime: Option<SystemTime>) -> bool {
        if mtime.is_some() && mtime != self.last_mtime {
            self.last_mtime = mtime;
            self.last_heartbeat = Instant::now();
            return true;
        }
        false
    }
}

enum RunEnd {
    Exited(ChildExit),
    Frozen,
    Cancelled,
}

pub struct Watchdog {
    launcher: Box<dyn ChildLauncher>,
    probe: Box<dyn WorkProbe>,
    settings: WatchdogSettings,
    cancel_token: CancellationToken,
}

impl Watchdog {
    pub fn new(
        launcher: Box<dyn ChildLauncher>,
        probe: Box<dyn WorkProbe>,
        settings: WatchdogSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            probe,
            settings,
            cancel_token,
        }
    }

    /// Supervise until the migration completes or the operator stops it
    pub async fn run(&self) -> Result<WatchdogOutcome> {
        info!(
            "Watchdog started (poll {}s, idle timeout {}s, grace {}s)",
            self.settings.poll_interval.as_secs(),
            self.settings.idle_timeout.as_secs(),
            self.settings.grace_period.as_secs()
        );
        let mut restarts = 0u32;

        loop {
            let mut child = self.launcher.launch()?;
            let mut state = WatchdogState::new(restarts, self.probe.progress_mtime());
            info!(
                "Transfer process running (pid {:?}, restart #{})",
                child.id(),
                state.restart_count
            );

            match self.supervise(child.as_mut(), &mut state).await? {
                RunEnd::Cancelled => {
                    info!("Interrupt received, stopping transfer process");
                    self.stop_child(child.as_mut()).await?;
                    return Ok(WatchdogOutcome::Terminated { restarts });
                }
                RunEnd::Frozen => {
                    warn!(
                        "No progress for {}s, transfer process considered frozen",
                        state.last_heartbeat.elapsed().as_secs()
                    );
                    for line in self.probe.tail(self.settings.tail_lines) {
                        warn!("  last progress: {}", line);
                    }
                    self.stop_child(child.as_mut()).await?;
                }
                RunEnd::Exited(exit) => {
                    if self.is_complete(exit) {
                        info!("Migration complete after {} restarts", restarts);
                        return Ok(WatchdogOutcome::Complete { restarts });
                    }
                }
            }

            if let Some(max) = self.settings.max_restarts {
                if restarts >= max {
                    error!("Giving up after {} restarts", restarts);
                    return Err(MigratorError::Process(format!(
                        "transfer still incomplete after {} restarts",
                        restarts
                    )));
                }
            }

            let ran_for = state.started_at.elapsed();
            if ran_for < self.settings.min_run {
                info!(
                    "Transfer ran for only {:.1}s, waiting {}s before restarting",
                    ran_for.as_secs_f64(),
                    self.settings.restart_delay.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.restart_delay) => {}
                    _ = self.cancel_token.cancelled() => {
                        return Ok(WatchdogOutcome::Terminated { restarts });
                    }
                }
            }

            // The child is gone; a sentinel left now blocks every checkpoint write
            if let Some(owner) = self.probe.lock_owner() {
                warn!("Checkpoint lock is still held by pid {} before restart", owner);
            }

            restarts += 1;
            info!("Restarting transfer process (restart #{})", restarts);
        }
    }

    async fn supervise(&self, child: &mut dyn SupervisedChild, state: &mut WatchdogState) -> Result<RunEnd> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.cancel_token.cancelled() => return Ok(RunEnd::Cancelled),
            }

            if let Some(exit) = child.try_wait()? {
                info!("Transfer process exited with {:?}", exit.code);
                return Ok(RunEnd::Exited(exit));
            }

            if state.observe(self.probe.progress_mtime()) {
                debug!("Heartbeat");
            }
            if state.last_heartbeat.elapsed() > self.settings.idle_timeout {
                return Ok(RunEnd::Frozen);
            }
        }
    }

    fn is_complete(&self, exit: ChildExit) -> bool {
        match self.probe.outstanding_work() {
            Ok(Some(0)) => true,
            Ok(Some(remaining)) => {
                info!("{} files still outstanding", remaining);
                false
            }
            Ok(None) => {
                if !exit.success() {
                    warn!("No source list yet and transfer exited with {:?}", exit.code);
                }
                exit.success()
            }
            Err(e) => {
                warn!("Could not determine outstanding work: {}", e);
                false
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL and wait
    async fn stop_child(&self, child: &mut dyn SupervisedChild) -> Result<()> {
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        if let Err(e) = child.terminate() {
            warn!("{}", e);
        }
        match tokio::time::timeout(self.settings.grace_period, child.wait()).await {
            Ok(Ok(exit)) => {
                info!("Transfer process stopped ({:?})", exit.code);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Waiting for transfer process failed: {}", e),
            Err(_) => warn!(
                "Transfer process ignored SIGTERM for {}s, killing it",
                self.settings.grace_period.as_secs()
            ),
        }

        child.kill().await?;
        child.wait().await?;
        Ok(())
    }
}
