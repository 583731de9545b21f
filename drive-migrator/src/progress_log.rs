//! Transfer progress log.
//!
//! One line per transfer event. The file's modification time doubles as the
//! watchdog heartbeat, so every event is flushed as it is written.

use crate::target::FileTarget;
use crate::utils::Result;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

/// Sink for transfer events.
///
/// Only `write_line` must be provided; the event helpers fix the line format.
pub trait TransferLog: Send + Sync {
    fn write_line(&self, level: Level, message: &str);

    fn start(&self, target: &FileTarget) {
        self.write_line(
            Level::Info,
            &format!(
                "START: {} (size={}, lastModified={})",
                target.relative_path,
                target.size.map(|s| s.to_string()).unwrap_or_else(|| "None".to_string()),
                target.last_modified.as_deref().unwrap_or("None"),
            ),
        );
    }

    fn success(&self, target: &FileTarget, elapsed: Duration) {
        self.write_line(
            Level::Info,
            &format!(
                "SUCCESS: {} [elapsed: {:.2}s]",
                target.relative_path,
                elapsed.as_secs_f64()
            ),
        );
    }

    fn error(&self, target: &FileTarget, retry: u32, err: &dyn Display) {
        self.write_line(
            Level::Error,
            &format!("ERROR: {} [retry={}] {}", target.relative_path, retry, err),
        );
    }

    fn skip(&self, target: &FileTarget) {
        self.write_line(Level::Info, &format!("SKIP: {}", target.relative_path));
    }
}

/// Size-rotated progress log file, echoed to `tracing`.
pub struct ProgressLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Mutex<Option<File>>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            backups,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// `log` -> `log.1` -> ... -> `log.{backups}`, dropping the oldest
    fn rotate(&self) -> std::io::Result<()> {
        if self.backups == 0 {
            return fs::remove_file(&self.path);
        }
        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());

        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if self.max_bytes > 0 && current > 0 && current + line.len() as u64 > self.max_bytes {
            *slot = None;
            self.rotate()?;
        }

        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }
}

impl TransferLog for ProgressLog {
    fn write_line(&self, level: Level, message: &str) {
        match level {
            Level::Info => info!("{}", message),
            Level::Error => error!("{}", message),
        }

        let line = format!(
            "[{}][{}] {}\n",
            chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
            level.as_str(),
            message
        );
        if let Err(e) = self.append(&line) {
            warn!("Failed to write progress log {}: {}", self.path.display(), e);
        }
    }
}

/// Last `n` lines of the progress log (empty when it does not exist)
pub fn tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let lines: Vec<String> = BufReader::new(file).lines().map_while(|l| l.ok()).collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip).collect()
}

/// Remove the progress log and its rotated backups
pub fn clear(path: &Path, backups: usize) -> Result<()> {
    let log = ProgressLog::new(path, 0, backups);
    let mut paths = vec![path.to_path_buf()];
    paths.extend((1..=backups).map(|i| log.backup_path(i)));

    for p in paths {
        match fs::remove_file(&p) {
            Ok(()) => info!("Removed {}", p.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Collects lines in memory
#[cfg(test)]
#[derive(Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

#[cfg(test)]
impl TransferLog for MemoryLog {
    fn write_line(&self, _level: Level, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}
