//! Drive Migrator Library
//!
//! Crash-safe bulk copy of a OneDrive folder tree into a SharePoint
//! document library over Microsoft Graph, with a watchdog that restarts
//! stalled transfers.

pub mod checkpoint;
pub mod config;
pub mod crawl;
pub mod daemon;
pub mod drive;
pub mod executor;
pub mod progress_log;
pub mod runner;
pub mod target;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use target::FileTarget;
pub use utils::errors::MigratorError;
pub type Result<T> = std::result::Result<T, MigratorError>;
