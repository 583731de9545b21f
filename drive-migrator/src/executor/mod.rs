//! Transfer executor - copies pending files from the source drive to the
//! destination drive.
//!
//! This module ties together:
//! - Checkpoint filtering
//! - Size-based upload strategy
//! - Bounded worker pool with per-file retry
//! - Progress log events and periodic throughput reports

pub mod strategy;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::drive::{ByteRange, ByteStream, RemoteDrive};
use crate::progress_log::TransferLog;
use crate::target::{join_path, FileTarget};
use crate::transfer::progress::{format_bytes, format_duration, format_speed, ProgressTracker, RunCounters};
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::{MigratorError, Result};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strategy::{ChunkReader, UploadStrategy};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval between throughput reports
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables of one transfer run
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub source_root: String,
    pub destination_root: String,
    pub max_parallel: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub large_file_threshold: u64,
    pub chunk_size: usize,
    pub report_interval: Duration,
}

impl TransferOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_root: config.source.root.clone(),
            destination_root: config.destination.root.clone(),
            max_parallel: config.transfer.max_parallel_transfers.max(1),
            retry_count: config.transfer.retry_count.max(1),
            retry_delay: config.transfer.retry_delay(),
            large_file_threshold: config.large_file_threshold(),
            chunk_size: config.chunk_size(),
            report_interval: REPORT_INTERVAL,
        }
    }
}

/// Outcome counts of one run, for the final log line
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    pub run_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub bytes: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// State shared by every worker task
struct WorkerContext {
    source: Arc<dyn RemoteDrive>,
    destination: Arc<dyn RemoteDrive>,
    checkpoint: CheckpointStore,
    log: Arc<dyn TransferLog>,
    options: TransferOptions,
    counters: Arc<RunCounters>,
}

/// Main transfer executor
pub struct TransferExecutor {
    source: Arc<dyn RemoteDrive>,
    destination: Arc<dyn RemoteDrive>,
    checkpoint: CheckpointStore,
    log: Arc<dyn TransferLog>,
    options: TransferOptions,
    cancel_token: CancellationToken,
}

impl TransferExecutor {
    /// Create a new executor (no cancellation support)
    pub fn new(
        source: Arc<dyn RemoteDrive>,
        destination: Arc<dyn RemoteDrive>,
        checkpoint: CheckpointStore,
        log: Arc<dyn TransferLog>,
        options: TransferOptions,
    ) -> Self {
        Self {
            source,
            destination,
            checkpoint,
            log,
            options,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop scheduling new files once `cancel_token` fires.
    /// Files already in flight run to completion.
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Copy every target that is not yet in the checkpoint
    pub async fn execute(&self, targets: Vec<FileTarget>) -> Result<TransferSummary> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();

        let store = self.checkpoint.clone();
        let entries = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| MigratorError::Transfer(format!("checkpoint load task failed: {}", e)))??;

        let done: HashSet<(&str, &str)> = entries.iter().map(|e| e.identity()).collect();
        let mut scheduled: HashSet<(String, String)> = HashSet::new();
        let mut pending = Vec::new();
        let mut skipped = 0usize;
        for target in targets {
            if done.contains(&target.identity()) {
                self.log.skip(&target);
                skipped += 1;
                continue;
            }
            let key = (target.relative_path.clone(), target.name.clone());
            if scheduled.insert(key) {
                pending.push(target);
            }
        }

        let pending_bytes: u64 = pending.iter().map(|t| t.byte_size()).sum();
        info!(
            "Transfer run {}: {} to copy ({}), {} already migrated, {} parallel",
            run_id,
            pending.len(),
            format_bytes(pending_bytes),
            skipped,
            self.options.max_parallel
        );

        let counters = Arc::new(RunCounters::default());
        let ctx = Arc::new(WorkerContext {
            source: Arc::clone(&self.source),
            destination: Arc::clone(&self.destination),
            checkpoint: self.checkpoint.clone(),
            log: Arc::clone(&self.log),
            options: self.options.clone(),
            counters: Arc::clone(&counters),
        });

        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&counters),
            pending.len(),
            self.options.report_interval,
            reporter_stop.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel));
        let attempted = pending.len();
        let mut handles = Vec::with_capacity(attempted);

        for target in pending {
            let sem = Arc::clone(&semaphore);
            let ctx = Arc::clone(&ctx);
            let cancel = self.cancel_token.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    result = sem.acquire_owned() => match result {
                        Ok(permit) => permit,
                        Err(_) => return Outcome::Cancelled,
                    },
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                };

                let outcome = transfer_with_retry(&ctx, &target).await;
                drop(permit);
                outcome
            }));
        }

        let mut cancelled = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Outcome::Cancelled) => cancelled += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("Transfer task panicked: {}", e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        reporter_stop.cancel();
        let _ = reporter.await;

        let (succeeded, failed, bytes) = counters.snapshot();
        let summary = TransferSummary {
            run_id,
            attempted,
            succeeded,
            failed,
            skipped,
            cancelled,
            bytes,
            duration: start_time.elapsed(),
        };

        info!(
            "Transfer run {} finished: {} succeeded, {} failed, {} skipped, {} not started, {} in {}",
            summary.run_id,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.cancelled,
            format_bytes(summary.bytes),
            format_duration(summary.duration.as_secs())
        );
        Ok(summary)
    }
}

/// Periodic throughput line while a run is active
fn spawn_reporter(
    counters: Arc<RunCounters>,
    total_files: usize,
    every: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new(total_files);
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => break,
            }

            let progress = tracker.sample(&counters);
            info!(
                "Progress: {}/{} files ({:.1}%), {} failed, {} read, {}, elapsed {}",
                progress.files_done,
                progress.total_files,
                progress.percent_complete(),
                progress.files_failed,
                format_bytes(progress.transferred_bytes),
                format_speed(progress.bytes_per_second),
                format_duration(tracker.elapsed().as_secs())
            );
        }
    })
}

/// Up to `retry_count` attempts with a fixed delay in between
async fn transfer_with_retry(ctx: &WorkerContext, target: &FileTarget) -> Outcome {
    let attempts = ctx.options.retry_count;

    for attempt in 1..=attempts {
        ctx.log.start(target);
        let started = Instant::now();

        match transfer_once(ctx, target).await {
            Ok(()) => {
                ctx.log.success(target, started.elapsed());
                return record_success(ctx, target).await;
            }
            Err(e) => {
                ctx.log.error(target, attempt, &e);
                if attempt < attempts {
                    tokio::time::sleep(ctx.options.retry_delay).await;
                }
            }
        }
    }

    warn!("Giving up on {} after {} attempts", target.relative_path, attempts);
    ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
    Outcome::Failed
}

async fn record_success(ctx: &WorkerContext, target: &FileTarget) -> Outcome {
    let store = ctx.checkpoint.clone();
    let entry = target.clone();
    let result = tokio::task::spawn_blocking(move || store.append(&entry)).await;

    match result {
        Ok(Ok(_)) => {
            ctx.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            Outcome::Succeeded
        }
        Ok(Err(e)) => {
            error!("Copied {} but could not checkpoint it: {}", target.relative_path, e);
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            Outcome::Failed
        }
        Err(e) => {
            error!("Checkpoint task for {} failed: {}", target.relative_path, e);
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            Outcome::Failed
        }
    }
}

async fn transfer_once(ctx: &WorkerContext, target: &FileTarget) -> Result<()> {
    let source_path = join_path(&[&ctx.options.source_root, &target.relative_path]);
    let destination_path = join_path(&[&ctx.options.destination_root, &target.relative_path]);
    let destination_parent = join_path(&[&ctx.options.destination_root, target.parent_path()]);
    let size = target.byte_size();

    let strategy = UploadStrategy::select(size, ctx.options.large_file_threshold, ctx.options.chunk_size);
    debug!("{} -> {} ({:?}, {} bytes)", source_path, destination_path, strategy, size);

    match strategy {
        UploadStrategy::Direct => {
            let download = ctx
                .source
                .open_download(target.remote_id.as_deref(), &source_path)
                .await?;
            ensure_folders(ctx.destination.as_ref(), &destination_parent).await?;

            let counters = Arc::clone(&ctx.counters);
            let sent = Arc::new(AtomicU64::new(0));
            let sent_by_stream = Arc::clone(&sent);
            let body: ByteStream = ProgressStream::new(
                download,
                Arc::new(move |n: u64| {
                    counters.add_bytes(n);
                    sent_by_stream.fetch_add(n, Ordering::Relaxed);
                }),
            )
            .boxed();
            ctx.destination.put_content(&destination_path, body).await?;

            let sent = sent.load(Ordering::Relaxed);
            match target.size {
                Some(expected) if sent != expected => Err(MigratorError::Transfer(format!(
                    "source sent {} bytes, expected {}",
                    sent, expected
                ))),
                _ => Ok(()),
            }
        }
        UploadStrategy::Chunked { chunk_size } => {
            ensure_folders(ctx.destination.as_ref(), &destination_parent).await?;
            let session = ctx
                .destination
                .create_upload_session(&destination_path, &target.name)
                .await?;
            let download = ctx
                .source
                .open_download(target.remote_id.as_deref(), &source_path)
                .await?;

            let mut reader = ChunkReader::new(download, chunk_size);
            let mut offset = 0u64;
            while offset < size {
                let chunk = reader.next_chunk().await?.ok_or_else(|| {
                    MigratorError::Transfer(format!(
                        "source ended after {} of {} bytes",
                        offset, size
                    ))
                })?;
                let len = chunk.len() as u64;
                if offset + len > size {
                    return Err(MigratorError::Transfer(format!(
                        "source is larger than the reported {} bytes",
                        size
                    )));
                }

                let range = ByteRange {
                    start: offset,
                    end: offset + len - 1,
                    total: size,
                };
                ctx.destination.upload_chunk(&session, range, chunk).await?;
                ctx.counters.add_bytes(len);
                offset += len;
            }
            Ok(())
        }
    }
}

/// Create every missing folder of `path`, top-down.
///
/// A failed existence check is logged and creation is attempted anyway;
/// creating a folder that already exists succeeds.
pub async fn ensure_folders(destination: &dyn RemoteDrive, path: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    for depth in 0..segments.len() {
        let parent = segments[..depth].join("/");
        let current = segments[..=depth].join("/");

        match destination.item_exists(&current).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => warn!("Could not check folder {}: {}", current, e),
        }
        destination.create_folder(&parent, segments[depth]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::lock::FileLock;
    use crate::drive::memory::{Call, MemoryDrive};
    use crate::progress_log::MemoryLog;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _dir: TempDir,
        source: Arc<MemoryDrive>,
        destination: Arc<MemoryDrive>,
        checkpoint: CheckpointStore,
        log: Arc<MemoryLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let checkpoint_path = dir.path().join("logs/checkpoint.json");
            let lock = FileLock::new(dir.path().join("logs/checkpoint.json.lock"), Duration::from_secs(5));
            Self {
                checkpoint: CheckpointStore::new(checkpoint_path, lock),
                _dir: dir,
                source: Arc::new(MemoryDrive::new()),
                destination: Arc::new(MemoryDrive::new()),
                log: Arc::new(MemoryLog::default()),
            }
        }

        fn options(&self) -> TransferOptions {
            TransferOptions {
                source_root: "Src".to_string(),
                destination_root: "Dst/Lib".to_string(),
                max_parallel: 4,
                retry_count: 3,
                retry_delay: Duration::from_millis(50),
                large_file_threshold: 4 * MIB,
                chunk_size: 5 * MIB as usize,
                report_interval: Duration::from_secs(60),
            }
        }

        fn executor(&self) -> TransferExecutor {
            TransferExecutor::new(
                self.source.clone(),
                self.destination.clone(),
                self.checkpoint.clone(),
                self.log.clone(),
                self.options(),
            )
        }

        fn add_source(&self, rel: &str, size: usize) -> FileTarget {
            let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            self.source.add_file(&format!("Src/{}", rel), content);
            FileTarget {
                name: rel.rsplit('/').next().unwrap().to_string(),
                relative_path: rel.to_string(),
                size: Some(size as u64),
                last_modified: None,
                remote_id: Some(format!("id-Src/{}", rel)),
            }
        }
    }

    fn chunk_calls(drive: &MemoryDrive, path: &str) -> Vec<ByteRange> {
        drive
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UploadChunk(p, range) if p == path => Some(range),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_end_to_end_and_idempotent_rerun() {
        let fx = Fixture::new();
        let targets = vec![
            fx.add_source("a.txt", 1000),
            fx.add_source("big/b.bin", 10_000_000),
            fx.add_source("c.txt", 2000),
        ];

        let summary = fx.executor().execute(targets.clone()).await.unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.bytes, 10_003_000);
        assert_eq!(fx.checkpoint.load().unwrap().len(), 3);

        let expected_chunks = strategy::chunk_count(10_000_000, 5 * MIB as usize);
        let ranges = chunk_calls(&fx.destination, "Dst/Lib/big/b.bin");
        assert_eq!(ranges.len() as u64, expected_chunks);
        assert_eq!(ranges[0].content_range(), "bytes 0-5242879/10000000");
        assert_eq!(ranges[1].content_range(), "bytes 5242880-9999999/10000000");

        assert_eq!(
            fx.destination.file("Dst/Lib/big/b.bin").unwrap(),
            fx.source.file("Src/big/b.bin").unwrap()
        );
        assert_eq!(fx.destination.file("Dst/Lib/a.txt").unwrap().len(), 1000);
        assert!(fx.destination.has_folder("Dst/Lib/big"));
        assert_eq!(fx.log.count("SUCCESS: "), 3);

        let writes_before = fx.destination.write_calls();
        let source_calls_before = fx.source.calls().len();
        let rerun = fx.executor().execute(targets).await.unwrap();
        assert_eq!(rerun.attempted, 0);
        assert_eq!(rerun.skipped, 3);
        assert_eq!(fx.destination.write_calls(), writes_before);
        assert_eq!(fx.source.calls().len(), source_calls_before);
        assert_eq!(fx.log.count("SKIP: "), 3);
        assert_eq!(fx.checkpoint.load().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_small_file_uses_single_put() {
        let fx = Fixture::new();
        let target = fx.add_source("docs/note.txt", (4 * MIB - 1) as usize);

        fx.executor().execute(vec![target]).await.unwrap();

        let calls = fx.destination.calls();
        assert!(calls.contains(&Call::PutContent("Dst/Lib/docs/note.txt".to_string())));
        assert!(!calls.iter().any(|c| matches!(c, Call::CreateSession(_))));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_not_checkpointed() {
        let fx = Fixture::new();
        let ok = fx.add_source("ok.txt", 10);
        let bad = fx.add_source("bad.txt", 10);
        fx.destination.fail_writes_to("Dst/Lib/bad.txt");

        let started = Instant::now();
        let summary = fx.executor().execute(vec![ok, bad]).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        // Two waits between three attempts
        assert!(started.elapsed() >= fx.options().retry_delay * 2);

        let attempts = fx
            .destination
            .calls()
            .iter()
            .filter(|c| **c == Call::PutContent("Dst/Lib/bad.txt".to_string()))
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(fx.log.count("ERROR: bad.txt"), 3);
        assert_eq!(fx.log.count("ERROR: bad.txt [retry=3]"), 1);

        let entries = fx.checkpoint.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "ok.txt");
    }

    #[tokio::test]
    async fn test_short_source_fails_chunked_attempt() {
        let fx = Fixture::new();
        let mut target = fx.add_source("short.bin", (4 * MIB) as usize);
        target.size = Some(6 * MIB);

        let summary = fx.executor().execute(vec![target]).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(fx.checkpoint.load().unwrap().is_empty());
        assert!(fx.log.lines().iter().any(|l| l.contains("source ended after")));
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_direct_upload() {
        let fx = Fixture::new();
        let mut grown = fx.add_source("grown.txt", 25);
        grown.size = Some(10);
        let mut unknown = fx.add_source("unknown.txt", 25);
        unknown.size = None;

        let summary = fx.executor().execute(vec![grown, unknown]).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(fx
            .log
            .lines()
            .iter()
            .any(|l| l.contains("ERROR: grown.txt") && l.contains("source sent 25 bytes, expected 10")));

        let entries = fx.checkpoint.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "unknown.txt");
        assert_eq!(fx.destination.file("Dst/Lib/unknown.txt").unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_only_fails_that_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("checkpoint.json.lock");
        let lock = FileLock::new(&lock_path, Duration::from_millis(200))
            .with_retry_interval(Duration::from_millis(5));
        let checkpoint = CheckpointStore::new(dir.path().join("checkpoint.json"), lock.clone());

        let fx = Fixture::new();
        let targets = vec![fx.add_source("first.txt", 10), fx.add_source("second.txt", 20)];
        let mut options = fx.options();
        options.max_parallel = 1;
        let executor = TransferExecutor::new(
            fx.source.clone(),
            fx.destination.clone(),
            checkpoint.clone(),
            fx.log.clone(),
            options,
        );

        // Held by someone else until the second upload begins, so the first
        // file's checkpoint write times out and the second one goes through.
        let holder = lock.acquire().unwrap();
        let destination = fx.destination.clone();
        let releaser = tokio::spawn(async move {
            let puts = || {
                destination
                    .calls()
                    .into_iter()
                    .filter(|c| matches!(c, Call::PutContent(_)))
                    .count()
            };
            while puts() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            drop(holder);
        });

        let summary = executor.execute(targets).await.unwrap();
        releaser.await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let uploaded: Vec<String> = fx
            .destination
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PutContent(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(uploaded.len(), 2);
        let entries = checkpoint.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(format!("Dst/Lib/{}", entries[0].relative_path), uploaded[1]);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_download_by_path_without_id() {
        let fx = Fixture::new();
        let mut target = fx.add_source("x.txt", 42);
        target.remote_id = None;

        let summary = fx.executor().execute(vec![target]).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(fx.source.calls().contains(&Call::Download("Src/x.txt".to_string())));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let fx = Fixture::new();
        let target = fx.add_source("a.txt", 10);
        let token = CancellationToken::new();
        token.cancel();

        let summary = fx.executor().with_cancel(token).execute(vec![target]).await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fx.destination.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_folders_creates_missing_segments_only() {
        let drive = MemoryDrive::new();
        drive.add_folder("Dst");

        ensure_folders(&drive, "Dst/a/b").await.unwrap();
        assert!(drive.has_folder("Dst/a/b"));

        let created: Vec<_> = drive
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::CreateFolder(_)))
            .collect();
        assert_eq!(
            created,
            vec![
                Call::CreateFolder("Dst/a".to_string()),
                Call::CreateFolder("Dst/a/b".to_string()),
            ]
        );
    }
}
