//! Drive Migrator - Main entry point
//!
//! OneDrive to SharePoint bulk migration with checkpointing and a freeze watchdog.

use anyhow::Result;
use clap::{Parser, Subcommand};
use drive_migrator::{
    config::Config,
    daemon::{FileProbe, ProcessLauncher, ShutdownCoordinator, Watchdog, WatchdogOutcome},
    drive::GraphDrive,
    progress_log::ProgressLog,
    runner::{MigrationRunner, TransferMode},
    utils,
};
use std::path::PathBuf;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy every file not yet in the checkpoint
    Transfer {
        /// Clear caches and checkpoint, re-crawl and rebuild the checkpoint, then stop
        #[arg(long, conflicts_with = "full_rebuild")]
        reset: bool,

        /// Like --reset, then transfer
        #[arg(long)]
        full_rebuild: bool,

        /// List already-migrated files during a rebuild
        #[arg(long)]
        verbose: bool,
    },

    /// Rebuild the checkpoint from the files present on the destination
    RebuildCheckpoint {
        /// Ignore cached crawl results
        #[arg(long)]
        force_crawl: bool,

        /// List already-migrated files
        #[arg(long)]
        verbose: bool,
    },

    /// Run `transfer` under supervision, restarting it when it stalls
    Watchdog,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    match args.command {
        Command::Watchdog => utils::logger::init_with_file(log_level, &config.paths.watchdog_log)?,
        _ => utils::logger::init(log_level)?,
    }

    config.validate()?;

    tracing::info!(
        "Starting drive-migrator v{} ({} -> {})",
        env!("CARGO_PKG_VERSION"),
        config.source.root,
        config.destination.root
    );

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();
    let signal_listener = shutdown_coordinator.listen();

    match args.command {
        Command::Transfer {
            reset,
            full_rebuild,
            verbose,
        } => {
            let mode = if reset {
                TransferMode::Reset
            } else if full_rebuild {
                TransferMode::FullRebuild
            } else {
                TransferMode::Normal
            };

            let runner = build_runner(&config)?.with_cancel(shutdown_coordinator.token());
            if let Some(summary) = runner.run(mode, verbose).await? {
                if summary.failed > 0 {
                    tracing::warn!("{} files failed and will be retried on the next run", summary.failed);
                }
            }
        }
        Command::RebuildCheckpoint {
            force_crawl,
            verbose,
        } => {
            let runner = build_runner(&config)?;
            let pending = runner.rebuild_checkpoint(None, force_crawl, verbose).await?;
            tracing::info!("{} files still to transfer", pending);
        }
        Command::Watchdog => {
            let launcher = ProcessLauncher::transfer_command(
                args.config.as_deref(),
                &config.paths.child_stdout,
                &config.paths.child_stderr,
            )?;
            let probe = FileProbe {
                progress_log: config.paths.progress_log.clone(),
                source_cache: config.paths.source_cache.clone(),
                checkpoint: config.paths.checkpoint.clone(),
                checkpoint_lock: config.checkpoint_lock(),
            };
            let watchdog = Watchdog::new(
                Box::new(launcher),
                Box::new(probe),
                (&config.watchdog).into(),
                shutdown_coordinator.token(),
            );

            match watchdog.run().await? {
                WatchdogOutcome::Complete { restarts } => {
                    tracing::info!("All files migrated ({} restarts)", restarts)
                }
                WatchdogOutcome::Terminated { restarts } => {
                    tracing::info!("Watchdog stopped by operator ({} restarts)", restarts)
                }
            }
        }
    }

    signal_listener.abort();
    Ok(())
}

fn build_runner(config: &Config) -> Result<MigrationRunner> {
    let (source, destination) = GraphDrive::pair_from_config(config)?;
    let progress_log = ProgressLog::new(
        &config.paths.progress_log,
        config.log.max_progress_log_mb * MIB,
        config.log.progress_log_backups,
    );

    Ok(MigrationRunner::new(
        config.clone(),
        Arc::new(source),
        Arc::new(destination),
        Arc::new(progress_log),
    ))
}
