//! Aggregate progress of a transfer run.
//!
//! Workers bump shared counters; a reporter samples them periodically and
//! derives throughput from the difference between samples.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every worker of one run
#[derive(Debug, Default)]
pub struct RunCounters {
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
    /// Bytes read from the source, including attempts that later failed
    pub bytes: AtomicU64,
}

impl RunCounters {
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (usize, usize, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub total_files: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
}

impl TransferProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_files == 0 {
            return 100.0;
        }
        ((self.files_done + self.files_failed) as f64 / self.total_files as f64 * 100.0).min(100.0)
    }
}

/// Turns successive counter samples into throughput figures
pub struct ProgressTracker {
    total_files: usize,
    start_time: Instant,
    last_sample: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total_files: usize) -> Self {
        let now = Instant::now();
        Self {
            total_files,
            start_time: now,
            last_sample: now,
            last_bytes: 0,
        }
    }

    pub fn sample(&mut self, counters: &RunCounters) -> TransferProgress {
        let (done, failed, bytes) = counters.snapshot();
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();

        let bytes_per_second = if elapsed > 0.0 {
            (bytes.saturating_sub(self.last_bytes) as f64 / elapsed) as u64
        } else {
            0
        };
        self.last_sample = now;
        self.last_bytes = bytes;

        TransferProgress {
            total_files: self.total_files,
            files_done: done,
            files_failed: failed,
            transferred_bytes: bytes,
            bytes_per_second,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
