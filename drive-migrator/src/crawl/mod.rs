//! Store crawling: enumerate the files under a drive folder.

pub mod cache;
pub mod walker;

pub use cache::{load_cache, load_or_crawl, save_cache};
pub use walker::{collect_file_targets, crawl, list_items, RawItem};
