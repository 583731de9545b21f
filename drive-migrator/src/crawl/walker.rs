//! Recursive drive traversal.
//!
//! Folders are listed one at a time, depth first. A listing that fails is
//! logged and treated as empty; the rest of the tree is still walked.

use crate::drive::{DriveItem, RemoteDrive};
use crate::target::{join_path, FileTarget};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Log a progress line every this many files
const PROGRESS_EVERY: usize = 1000;

/// A listed item and the root-relative folder it was found in
#[derive(Debug, Clone)]
pub struct RawItem {
    pub item: DriveItem,
    pub folder: String,
}

/// List every item (files and folders) below `root`
pub async fn list_items(drive: &dyn RemoteDrive, root: &str) -> Vec<RawItem> {
    let mut items = Vec::new();
    let mut files_seen = 0usize;
    list_folder(drive, root, String::new(), &mut items, &mut files_seen).await;
    debug!("Listed {} items under {}", items.len(), root);
    items
}

fn list_folder<'a>(
    drive: &'a dyn RemoteDrive,
    root: &'a str,
    folder: String,
    out: &'a mut Vec<RawItem>,
    files_seen: &'a mut usize,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let path = join_path(&[root, &folder]);
        let children = match drive.list_children(&path).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to list {}: {}", path, e);
                return;
            }
        };

        for child in children {
            if child.is_folder() {
                let subfolder = join_path(&[&folder, &child.name]);
                out.push(RawItem {
                    item: child,
                    folder: folder.clone(),
                });
                list_folder(drive, root, subfolder, out, files_seen).await;
            } else {
                *files_seen += 1;
                if *files_seen % PROGRESS_EVERY == 0 {
                    info!("Crawling {}: {} files so far", root, files_seen);
                }
                out.push(RawItem {
                    item: child,
                    folder: folder.clone(),
                });
            }
        }
    })
}

/// Flatten listed items into file targets.
///
/// Folders are dropped. Paths are `parent_path/folder/name`; an item seen
/// twice with the same path and id is kept once.
pub fn collect_file_targets(items: &[RawItem], parent_path: &str) -> Vec<FileTarget> {
    let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
    let mut targets = Vec::new();

    for raw in items.iter().filter(|r| !r.item.is_folder()) {
        let relative_path = join_path(&[parent_path, &raw.folder, &raw.item.name]);
        if !seen.insert((relative_path.clone(), raw.item.id.clone())) {
            continue;
        }
        targets.push(FileTarget {
            name: raw.item.name.clone(),
            relative_path,
            size: raw.item.size,
            last_modified: raw.item.last_modified_date_time.clone(),
            remote_id: raw.item.id.clone(),
        });
    }

    targets
}

/// Crawl `root` and return its files with root-relative paths
pub async fn crawl(drive: &dyn RemoteDrive, root: &str) -> Vec<FileTarget> {
    info!("Crawling {}", root);
    let items = list_items(drive, root).await;
    let targets = collect_file_targets(&items, "");
    info!("Crawl of {} complete: {} files", root, targets.len());
    targets
}
