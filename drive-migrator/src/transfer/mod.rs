//! Transfer progress accounting.

pub mod progress;
pub mod progress_stream;
