//! Custom error types for the migrator.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Graph API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Timeout waiting for lock {path} (held by {owner})")]
    LockTimeout { path: PathBuf, owner: String },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl MigratorError {
    /// HTTP status of a failed Graph call, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            MigratorError::Api { status, .. } => Some(*status),
            MigratorError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for MigratorError {
    fn from(e: config::ConfigError) -> Self {
        MigratorError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MigratorError>;
