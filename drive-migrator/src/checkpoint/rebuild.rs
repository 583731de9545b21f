//! Reconstruct the checkpoint from what already exists at the destination.

use crate::target::FileTarget;
use std::collections::HashSet;
use tracing::{debug, info};

/// Source targets whose identity is already present on the destination.
///
/// Both crawls produce paths relative to their own roots, so a file copied
/// to `<dest root>/a/b.txt` matches source `<source root>/a/b.txt` directly.
/// The source entry (not the destination one) is kept so the checkpoint
/// carries source ids and sizes. Size and timestamp are not compared.
pub fn rebuild_from_destination(
    source: &[FileTarget],
    destination: &[FileTarget],
) -> Vec<FileTarget> {
    let present: HashSet<(&str, &str)> = destination.iter().map(|t| t.identity()).collect();

    let mut seen = HashSet::new();
    let mut rebuilt = Vec::new();
    for target in source {
        if present.contains(&target.identity()) && seen.insert(target.identity()) {
            debug!("Matched on destination: {}", target.relative_path);
            rebuilt.push(target.clone());
        }
    }

    info!(
        "Checkpoint rebuilt: {} matched, {} source files, {} pending",
        rebuilt.len(),
        source.len(),
        source.len() - rebuilt.len()
    );
    rebuilt
}
