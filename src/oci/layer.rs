//! Binding layer trees to the build history that produced them.

use std::{collections::HashMap, fmt, sync::Arc};

use indicatif::DecimalBytes;
use log::debug;
use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::{
    error::{AnalysisError, Result},
    oci::manifest::{HistoryEntry, ManifestModel},
    tree::LayerTree,
};

const SHELL_PREFIX: &str = "/bin/sh -c ";
const LAYER_TAR_SUFFIX: &str = "/layer.tar";
const SHORT_ID_LEN: usize = 25;

/// A content-bearing layer of an image.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: String,
    /// 0 for the newest layer, counting up towards the base layer.
    pub index: usize,
    /// Total size of the regular files in the layer's archive.
    pub size: u64,
    pub tar_path: String,
    pub is_base: bool,
    pub history: HistoryEntry,
    pub tree: Arc<LayerTree>,
}

impl Layer {
    fn new(
        history: &HistoryEntry,
        index: usize,
        tar_path: &str,
        tree: Arc<LayerTree>,
        is_base: bool,
    ) -> Self {
        let size = tree.total_size();
        Self {
            id: history.id.clone(),
            index,
            size,
            tar_path: tar_path.to_string(),
            is_base,
            history: HistoryEntry {
                size,
                ..history.clone()
            },
            tree,
        }
    }

    /// The first 25 characters of the id.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }

    /// The build command, without the shell invocation Docker wraps `RUN` steps in.
    pub fn command(&self) -> &str {
        let created_by = self.history.created_by.as_str();
        created_by.strip_prefix(SHELL_PREFIX).unwrap_or(created_by)
    }

    /// The name of the layer's directory in the image archive.
    pub fn tar_id(&self) -> &str {
        let tar_path = self.tar_path.as_str();
        tar_path.strip_suffix(LAYER_TAR_SUFFIX).unwrap_or(tar_path)
    }
}

/// Serialized with the derived columns of the text form and without the tree.
impl Serialize for Layer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Layer", 9)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("short_id", self.short_id())?;
        state.serialize_field("index", &self.index)?;
        state.serialize_field("size", &self.size)?;
        state.serialize_field("command", self.command())?;
        state.serialize_field("tar_path", &self.tar_path)?;
        state.serialize_field("tar_id", self.tar_id())?;
        state.serialize_field("is_base", &self.is_base)?;
        state.serialize_field("history", &self.history)?;
        state.end()
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = DecimalBytes(self.size).to_string();
        if self.is_base {
            write!(f, "{:<25} {size:>7}  FROM {}", self.short_id(), self.short_id())
        } else {
            write!(f, "{:<25} {size:>7}  {}", self.short_id(), self.command())
        }
    }
}

/// Pairs the layer trees with the history entries that produced them.
///
/// Returns the layers ordered by [`Layer::index`] (newest first) together with the trees in
/// chronological order (base first).  Both share the same `Arc`s.
pub fn assemble_layers(
    manifest: &ManifestModel,
    tree_set: &HashMap<String, Arc<LayerTree>>,
) -> Result<(Vec<Layer>, Vec<Arc<LayerTree>>)> {
    let trees = manifest
        .layer_tar_paths
        .iter()
        .map(|path| {
            tree_set
                .get(path)
                .cloned()
                .ok_or_else(|| AnalysisError::MissingLayerTree(path.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let n = trees.len();
    let produced = manifest.config.layer_history().count();
    if produced != n {
        return Err(AnalysisError::ManifestMismatch(format!(
            "manifest lists {n} layers but {produced} history entries produced a layer"
        )));
    }

    let mut layers: Vec<_> = (0..n)
        .zip((0..n).rev())
        .zip(manifest.config.layer_history())
        .map(|((position, index), history)| {
            Layer::new(
                history,
                index,
                &manifest.layer_tar_paths[position],
                Arc::clone(&trees[position]),
                index + 1 == n,
            )
        })
        .collect();
    layers.sort_by_key(|layer| layer.index);

    for layer in &layers {
        let position = n - 1 - layer.index;
        if !Arc::ptr_eq(&layer.tree, &trees[position]) || layer.size != layer.tree.total_size() {
            return Err(AnalysisError::InconsistentLayer { index: layer.index });
        }
        debug!("{layer}");
    }

    Ok((layers, trees))
}
