//! The metadata documents of a saved image: `manifest.json` and the image config it points to.

use std::collections::HashMap;

use log::{debug, warn};
use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

pub const MANIFEST_PATH: &str = "manifest.json";

/// The id given to history entries that did not produce a layer.
pub const EMPTY_LAYER_ID: &str = "<missing>";

/// One element of `manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    layers: Vec<String>,
}

/// A build step recorded in the image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub created_by: String,
    pub empty_layer: bool,
    /// The diff id of the layer this step produced, or [`EMPTY_LAYER_ID`].
    pub id: String,
    /// Content size of the layer; filled in once the layer has been measured.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The parts of the image config we use.
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    /// Chronological, including steps that did not produce a layer.
    pub history: Vec<HistoryEntry>,
    pub diff_ids: Vec<String>,
}

impl ImageConfig {
    /// Reads the history and diff ids out of an image config document.
    ///
    /// Every history entry that produced a layer gets the next diff id, in order.
    pub fn parse(path: &str, content: &[u8]) -> Result<Self> {
        let config = ImageConfiguration::from_reader(content).map_err(|source| {
            AnalysisError::Config {
                path: path.to_string(),
                source,
            }
        })?;

        let diff_ids = config.rootfs().diff_ids().clone();
        let mut next_diff_id = diff_ids.iter();
        let mut history = Vec::with_capacity(config.history().len());

        for entry in config.history() {
            let empty_layer = entry.empty_layer().unwrap_or(false);
            let id = if empty_layer {
                EMPTY_LAYER_ID.to_string()
            } else {
                next_diff_id.next().cloned().ok_or_else(|| {
                    AnalysisError::ManifestMismatch(format!(
                        "{path} has more layer-producing history entries than diff ids ({})",
                        diff_ids.len()
                    ))
                })?
            };

            history.push(HistoryEntry {
                created_by: entry.created_by().clone().unwrap_or_default(),
                empty_layer,
                id,
                size: 0,
                created: entry.created().clone(),
                comment: entry.comment().clone(),
            });
        }

        Ok(Self { history, diff_ids })
    }

    /// The history entries that produced a layer, oldest first.
    pub fn layer_history(&self) -> impl Iterator<Item = &HistoryEntry> + use<'_> {
        self.history.iter().filter(|entry| !entry.empty_layer)
    }
}

/// Everything the analysis needs to know about an image besides its layer contents.
#[derive(Debug, Clone)]
pub struct ManifestModel {
    pub config_path: String,
    /// Entry names of the layer archives, base layer first.
    pub layer_tar_paths: Vec<String>,
    pub repo_tags: Vec<String>,
    pub config: ImageConfig,
}

impl ManifestModel {
    /// Builds the model from the JSON documents found in an image archive.
    ///
    /// Only the first image listed in `manifest.json` is considered.
    pub fn from_json_files(json_files: &HashMap<String, Vec<u8>>) -> Result<Self> {
        let content = json_files.get(MANIFEST_PATH).ok_or_else(|| {
            AnalysisError::ManifestMismatch(format!("archive has no {MANIFEST_PATH}"))
        })?;

        let entries: Vec<ManifestEntry> =
            serde_json::from_slice(content).map_err(|source| AnalysisError::Json {
                path: MANIFEST_PATH.to_string(),
                source,
            })?;

        let mut entries = entries.into_iter();
        let Some(entry) = entries.next() else {
            return Err(AnalysisError::ManifestMismatch(format!(
                "{MANIFEST_PATH} lists no images"
            )));
        };
        if entries.len() > 0 {
            warn!(
                "{MANIFEST_PATH} lists {} images, analyzing only the first",
                entries.len() + 1
            );
        }

        let config_content = json_files.get(&entry.config).ok_or_else(|| {
            AnalysisError::ManifestMismatch(format!(
                "image config {} is not in the archive",
                entry.config
            ))
        })?;
        let config = ImageConfig::parse(&entry.config, config_content)?;

        debug!(
            "manifest: config {}, {} layers, {} history entries",
            entry.config,
            entry.layers.len(),
            config.history.len()
        );

        Ok(Self {
            config_path: entry.config,
            layer_tar_paths: entry.layers,
            repo_tags: entry.repo_tags.unwrap_or_default(),
            config,
        })
    }
}
