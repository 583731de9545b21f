//! Configuration management for the migrator.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MIGRATOR_*` environment variables (`MIGRATOR_TRANSFER__RETRY_COUNT=5`).
//! A `.env` file in the working directory is loaded first and never
//! overrides variables already present in the process environment.

use crate::utils::{MigratorError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Graph upload sessions only accept chunks that are multiples of 320 KiB.
pub const UPLOAD_CHUNK_ALIGNMENT: usize = 320 * 1024;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub transfer: TransferConfig,
    pub paths: PathsConfig,
    pub watchdog: WatchdogConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Azure AD tenant
    pub tenant_id: String,

    /// App registration (client credentials flow)
    pub client_id: String,
    pub client_secret: String,

    /// Token endpoint host
    pub authority_host: String,

    /// Graph API root, without trailing slash
    pub graph_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// OneDrive owner; used when `drive_id` is not set
    pub user_principal_name: Option<String>,

    /// Explicit source drive id
    pub drive_id: Option<String>,

    /// Folder below the drive root to migrate
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub site_id: String,
    pub drive_id: String,

    /// Folder below the document library root receiving the files
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Worker pool size
    pub max_parallel_transfers: usize,

    /// Attempts per file (not retries after the first)
    pub retry_count: u32,

    /// Fixed delay between attempts
    pub retry_delay_ms: u64,

    /// Per-request timeout for listing and metadata calls
    pub timeout_sec: u64,

    /// Files at or above this size use an upload session
    pub large_file_threshold_mb: u64,

    /// Upload session chunk size
    pub chunk_size_mb: u64,

    /// How long a worker waits for the checkpoint lock
    pub lock_timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoint: PathBuf,
    pub source_cache: PathBuf,
    pub destination_cache: PathBuf,
    pub progress_log: PathBuf,
    pub config_hash: PathBuf,
    pub watchdog_log: PathBuf,
    pub child_stdout: PathBuf,
    pub child_stderr: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_sec: u64,
    pub idle_timeout_sec: u64,
    pub grace_period_sec: u64,

    /// Runs shorter than this are followed by `restart_delay_sec`
    pub min_run_sec: u64,
    pub restart_delay_sec: u64,

    /// Progress log lines captured when a freeze is detected
    pub tail_lines: usize,

    /// Give up after this many restarts (unlimited when unset)
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Progress log rotation threshold
    pub max_progress_log_mb: u64,

    /// Rotated progress logs kept (`.1` .. `.N`)
    pub progress_log_backups: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            authority_host: "https://login.microsoftonline.com".to_string(),
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            user_principal_name: None,
            drive_id: None,
            root: "TEST-Onedrive".to_string(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            drive_id: String::new(),
            root: "TEST-Sharepoint".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallel_transfers: 4,
            retry_count: 3,
            retry_delay_ms: 1000,
            timeout_sec: 10,
            large_file_threshold_mb: 4,
            chunk_size_mb: 5,
            lock_timeout_sec: 10,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let logs = PathBuf::from("logs");
        Self {
            checkpoint: logs.join("checkpoint.json"),
            source_cache: logs.join("source_files.json"),
            destination_cache: logs.join("destination_files.json"),
            progress_log: logs.join("transfer_progress.log"),
            config_hash: logs.join("config_hash.txt"),
            watchdog_log: logs.join("watchdog.log"),
            child_stdout: logs.join("transfer_stdout.log"),
            child_stderr: logs.join("transfer_stderr.log"),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 30,
            idle_timeout_sec: 600,
            grace_period_sec: 10,
            min_run_sec: 60,
            restart_delay_sec: 5,
            tail_lines: 5,
            max_restarts: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_progress_log_mb: 5,
            progress_log_backups: 3,
        }
    }
}

/// Environment names used by earlier deployments' `.env` files.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("CLIENT_ID", "auth.client_id"),
    ("CLIENT_SECRET", "auth.client_secret"),
    ("TENANT_ID", "auth.tenant_id"),
    ("SOURCE_ONEDRIVE_USER_PRINCIPAL_NAME", "source.user_principal_name"),
    ("SOURCE_ONEDRIVE_DRIVE_ID", "source.drive_id"),
    ("SOURCE_ONEDRIVE_FOLDER_PATH", "source.root"),
    ("DESTINATION_SHAREPOINT_SITE_ID", "destination.site_id"),
    ("DESTINATION_SHAREPOINT_DRIVE_ID", "destination.drive_id"),
    ("DESTINATION_SHAREPOINT_DOCLIB", "destination.root"),
];

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MIGRATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        for (var, key) in LEGACY_ENV {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check everything needed before any network call is made.
    ///
    /// Missing credentials or drive identifiers are fatal: the process must
    /// not start, and the watchdog must not keep restarting it.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.auth.tenant_id.is_empty() {
            missing.push("auth.tenant_id");
        }
        if self.auth.client_id.is_empty() {
            missing.push("auth.client_id");
        }
        if self.auth.client_secret.is_empty() {
            missing.push("auth.client_secret");
        }
        if self.source.user_principal_name.is_none() && self.source.drive_id.is_none() {
            missing.push("source.user_principal_name or source.drive_id");
        }
        if self.destination.site_id.is_empty() {
            missing.push("destination.site_id");
        }
        if self.destination.drive_id.is_empty() {
            missing.push("destination.drive_id");
        }
        if !missing.is_empty() {
            return Err(MigratorError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.transfer.max_parallel_transfers == 0 {
            return Err(MigratorError::Config(
                "transfer.max_parallel_transfers must be at least 1".to_string(),
            ));
        }
        if self.transfer.retry_count == 0 {
            return Err(MigratorError::Config(
                "transfer.retry_count must be at least 1".to_string(),
            ));
        }
        if self.transfer.large_file_threshold_mb == 0 {
            return Err(MigratorError::Config(
                "transfer.large_file_threshold_mb must be at least 1".to_string(),
            ));
        }
        if self.chunk_size() == 0 || self.chunk_size() % UPLOAD_CHUNK_ALIGNMENT != 0 {
            return Err(MigratorError::Config(format!(
                "transfer.chunk_size_mb must be a positive multiple of {} bytes",
                UPLOAD_CHUNK_ALIGNMENT
            )));
        }

        Ok(())
    }

    /// Size at which the chunked upload strategy takes over, in bytes
    pub fn large_file_threshold(&self) -> u64 {
        self.transfer.large_file_threshold_mb * MIB
    }

    /// Upload session chunk size, in bytes
    pub fn chunk_size(&self) -> usize {
        (self.transfer.chunk_size_mb * MIB) as usize
    }

    /// Lock sentinel colocated with the checkpoint file
    pub fn checkpoint_lock(&self) -> PathBuf {
        let mut name = self.paths.checkpoint.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Digest of the settings that decide *what* is being migrated.
    ///
    /// When it changes between runs the cached crawls and the checkpoint
    /// describe a different migration and must be rebuilt.
    pub fn fingerprint(&self) -> String {
        let identity = format!(
            "{}|{}|{}|{}|{}|{}",
            self.source.user_principal_name.as_deref().unwrap_or(""),
            self.source.drive_id.as_deref().unwrap_or(""),
            self.source.root,
            self.destination.site_id,
            self.destination.drive_id,
            self.destination.root,
        );
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl TransferConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_sec)
    }
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_sec)
    }

    pub fn min_run(&self) -> Duration {
        Duration::from_secs(self.min_run_sec)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_sec)
    }
}
