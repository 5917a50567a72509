//! Cross-layer accounting of bytes that are written and later overwritten.
//!
//! A regular file written by one layer and written again by a later layer still takes up space
//! in the earlier layer's archive, even though nothing can ever see that copy.  Those bytes are
//! wasted.  Deleting a file (a whiteout) doesn't waste anything by this measure: the bytes are
//! already gone from the merged view and it's not a second copy.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;

use crate::tree::LayerTree;

/// One regular-file write of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathOccurrence {
    /// Chronological position of the layer (0 = base).
    pub layer: usize,
    pub size: u64,
}

/// A path that was written as a regular file by more than one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicatePath {
    pub path: PathBuf,
    /// Sum of the sizes of every write except the last.
    pub cumulative_wasted_size: u64,
    /// All writes, oldest first.  The last one is the one that remains visible.
    pub occurrences: Vec<PathOccurrence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EfficiencyReport {
    pub efficiency_score: f64,
    pub wasted_bytes: u64,
    pub size_bytes: u64,
    /// Size of every layer except the base layer.
    pub user_size_bytes: u64,
    /// `wasted_bytes / user_size_bytes`, or 0 if there are no user bytes.
    pub wasted_user_percent: f64,
    /// Ordered by wasted size, largest first.
    pub duplicate_paths: Vec<DuplicatePath>,
}

/// Computes duplication across `trees`, which must be in chronological order.
pub fn analyze_efficiency(trees: &[Arc<LayerTree>]) -> EfficiencyReport {
    let mut occurrences: BTreeMap<&Path, Vec<PathOccurrence>> = BTreeMap::new();

    for (layer, tree) in trees.iter().enumerate() {
        for (path, record) in tree.walk() {
            if record.kind.is_regular() {
                occurrences.entry(path).or_default().push(PathOccurrence {
                    layer,
                    size: record.size,
                });
            }
        }
    }

    let mut duplicate_paths: Vec<_> = occurrences
        .into_iter()
        .filter_map(|(path, occurrences)| {
            let (_kept, overwritten) = occurrences.split_last()?;
            let cumulative_wasted_size: u64 = overwritten.iter().map(|o| o.size).sum();
            (cumulative_wasted_size > 0).then(|| DuplicatePath {
                path: path.to_path_buf(),
                cumulative_wasted_size,
                occurrences,
            })
        })
        .collect();

    // paths come out of the map sorted, and the sort is stable
    duplicate_paths.sort_by(|a, b| b.cumulative_wasted_size.cmp(&a.cumulative_wasted_size));

    let wasted_bytes: u64 = duplicate_paths.iter().map(|d| d.cumulative_wasted_size).sum();
    let size_bytes: u64 = trees.iter().map(|t| t.total_size()).sum();
    let user_size_bytes: u64 = trees.iter().skip(1).map(|t| t.total_size()).sum();

    let (efficiency_score, wasted_user_percent) = if user_size_bytes > 0 {
        let ratio = wasted_bytes as f64 / user_size_bytes as f64;
        ((1.0 - ratio).clamp(0.0, 1.0), ratio)
    } else {
        (1.0, 0.0)
    };

    EfficiencyReport {
        efficiency_score,
        wasted_bytes,
        size_bytes,
        user_size_bytes,
        wasted_user_percent,
        duplicate_paths,
    }
}
