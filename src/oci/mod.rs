//! Analysis of saved container images.
//!
//! [`ImageAnalyzer`] reads a `docker save` archive from any [`Read`] source.  The archive is
//! scanned once on a blocking thread; each layer archive found along the way is turned into a
//! [`LayerTree`] on its own blocking task while the scan continues.  Once every layer is built
//! the trees are bound to the image history and measured.

pub mod layer;
pub mod manifest;
pub mod tar;

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    thread::available_parallelism,
    time::Duration,
};

use log::{debug, warn};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};

use self::{
    layer::{assemble_layers, Layer},
    manifest::ManifestModel,
    tar::{scan_image, LayerArchive},
};
use crate::{
    builder::LayerBuilder,
    efficiency::{analyze_efficiency, DuplicatePath},
    error::{AnalysisError, Result},
    progress::{NoProgress, ProgressEvent, ProgressSink},
    tree::{squash, LayerTree},
};

/// Tuning knobs for [`ImageAnalyzer`].
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    /// How many layers may be built at once.  Defaults to the available parallelism.
    pub jobs: Option<NonZeroUsize>,
    /// Upper bound on the whole analysis.
    pub timeout: Option<Duration>,
}

impl AnalyzerOptions {
    fn jobs(&self) -> usize {
        self.jobs
            .or_else(|| available_parallelism().ok())
            .map_or(1, NonZeroUsize::get)
    }
}

/// Everything learned about an image.
#[derive(Debug, Serialize)]
pub struct AnalysisResult {
    /// Newest layer first.
    pub layers: Vec<Layer>,
    /// Base layer first.  The same trees the layers refer to.
    #[serde(skip)]
    pub trees: Vec<Arc<LayerTree>>,
    pub efficiency_score: f64,
    pub wasted_bytes: u64,
    pub size_bytes: u64,
    pub user_size_bytes: u64,
    pub wasted_user_percent: f64,
    /// Size of the regular files visible once all layers are stacked.
    pub squashed_size_bytes: u64,
    pub duplicate_paths: Vec<DuplicatePath>,
    pub repo_tags: Vec<String>,
}

/// Binds the built trees to the manifest and measures them.
///
/// `tree_set` maps layer archive names, as listed in the manifest, to their trees.
pub fn aggregate(
    manifest: &ManifestModel,
    tree_set: &HashMap<String, Arc<LayerTree>>,
) -> Result<AnalysisResult> {
    let (layers, trees) = assemble_layers(manifest, tree_set)?;
    let report = analyze_efficiency(&trees);
    let squashed = squash(&trees);

    debug!(
        "{} layers, {} bytes, {} wasted, score {:.4}",
        layers.len(),
        report.size_bytes,
        report.wasted_bytes,
        report.efficiency_score
    );

    Ok(AnalysisResult {
        layers,
        trees,
        efficiency_score: report.efficiency_score,
        wasted_bytes: report.wasted_bytes,
        size_bytes: report.size_bytes,
        user_size_bytes: report.user_size_bytes,
        wasted_user_percent: report.wasted_user_percent,
        squashed_size_bytes: squashed.total_size(),
        duplicate_paths: report.duplicate_paths,
        repo_tags: manifest.repo_tags.clone(),
    })
}

type BuiltLayer = (String, Arc<LayerTree>);

/// Fails every read once nobody is waiting for layers any more, so that an abandoned scan
/// does not keep consuming its input.
struct StopOnClose<R> {
    inner: R,
    sender: mpsc::Sender<LayerArchive>,
}

impl<R: Read> Read for StopOnClose<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sender.is_closed() {
            return Err(io::Error::other("analysis cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Drives the analysis of one image archive.
pub struct ImageAnalyzer {
    options: AnalyzerOptions,
    progress: Arc<dyn ProgressSink>,
}

impl ImageAnalyzer {
    pub fn new(options: AnalyzerOptions) -> Self {
        Self {
            options,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Analyzes the archive at `path`.
    pub async fn analyze_path(&self, path: impl AsRef<Path>) -> Result<AnalysisResult> {
        let path: PathBuf = path.as_ref().into();
        let file = File::open(&path).map_err(AnalysisError::io(path.display().to_string()))?;
        self.analyze(BufReader::new(file)).await
    }

    /// Analyzes the archive read from `reader`.
    ///
    /// Dropping the returned future stops the analysis: running layer builds are aborted and
    /// the archive scan fails its next read of `reader`.
    pub async fn analyze<R: Read + Send + 'static>(&self, reader: R) -> Result<AnalysisResult> {
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(reader))
                .await
                .map_err(|_| AnalysisError::TimedOut(limit))?,
            None => self.run(reader).await,
        }
    }

    async fn run<R: Read + Send + 'static>(&self, reader: R) -> Result<AnalysisResult> {
        let jobs = self.options.jobs();
        debug!("analyzing with {jobs} jobs");

        let (sender, mut receiver) = mpsc::channel::<LayerArchive>(jobs);
        let scanner = tokio::task::spawn_blocking(move || {
            let reader = StopOnClose {
                inner: reader,
                sender: sender.clone(),
            };
            let scanned = scan_image(reader, |layer| {
                sender
                    .blocking_send(layer)
                    .map_err(|_| AnalysisError::Cancelled)
            });
            match scanned {
                Err(_) if sender.is_closed() => Err(AnalysisError::Cancelled),
                scanned => scanned,
            }
        });

        let sem = Arc::new(Semaphore::new(jobs));
        let mut builds: JoinSet<Result<BuiltLayer>> = JoinSet::new();
        let mut tree_set = HashMap::new();

        while let Some(layer) = receiver.recv().await {
            while let Some(built) = builds.try_join_next() {
                let (name, tree) = built??;
                tree_set.insert(name, tree);
            }

            let permit = Arc::clone(&sem)
                .acquire_owned()
                .await
                .map_err(|_| AnalysisError::Cancelled)?;
            let progress = Arc::clone(&self.progress);

            builds.spawn_blocking(move || {
                let _permit = permit;
                let LayerArchive {
                    position,
                    name,
                    records,
                } = layer;
                let tree = LayerBuilder::new(name.as_str())
                    .with_progress(position, progress)
                    .build(&records)?;
                Ok((name, Arc::new(tree)))
            });
        }

        let scanned = scanner.await??;
        self.progress.event(&ProgressEvent::ArchiveScanned {
            layers: scanned.layers,
        });

        while let Some(built) = builds.join_next().await {
            let (name, tree) = built??;
            tree_set.insert(name, tree);
        }

        for (alias, target) in scanned.layer_aliases {
            match tree_set.get(&target) {
                Some(tree) => {
                    let tree = Arc::clone(tree);
                    tree_set.insert(alias, tree);
                }
                None => warn!("layer archive {alias} links to missing {target}"),
            }
        }

        let manifest = ManifestModel::from_json_files(&scanned.json_files)?;
        aggregate(&manifest, &tree_set)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        oci::manifest::{HistoryEntry, ImageConfig},
        test::{file, tree, whiteout},
    };

    fn manifest(layers: &[&str]) -> ManifestModel {
        let history = layers
            .iter()
            .map(|l| HistoryEntry {
                created_by: format!("ADD {l}"),
                empty_layer: false,
                id: format!("sha256:{l}"),
                size: 0,
                created: None,
                comment: None,
            })
            .collect();
        ManifestModel {
            config_path: "cfg.json".into(),
            layer_tar_paths: layers.iter().map(|l| l.to_string()).collect(),
            repo_tags: vec!["test:latest".into()],
            config: ImageConfig {
                history,
                diff_ids: vec![],
            },
        }
    }

    #[test]
    fn test_aggregate() {
        let tree_set = HashMap::from([
            ("a".to_string(), Arc::new(tree("a", [file("/bin/sh", 500), file("/x", 5)]))),
            ("b".to_string(), Arc::new(tree("b", [whiteout("/bin/sh"), file("/x", 7)]))),
        ]);

        let result = aggregate(&manifest(&["a", "b"]), &tree_set).unwrap();

        assert_eq!(result.size_bytes, 512);
        assert_eq!(result.user_size_bytes, 7);
        assert_eq!(result.wasted_bytes, 5);
        assert_eq!(result.squashed_size_bytes, 7);
        assert_eq!(result.repo_tags, ["test:latest"]);
        assert_eq!(result.layers[0].tar_path, "b");
        assert!(Arc::ptr_eq(&result.trees[0], &tree_set["a"]));

        for layer in &result.layers {
            assert_eq!(layer.size, layer.tree.total_size());
        }
    }

    #[test]
    fn test_result_serialization_omits_trees() {
        let tree_set = HashMap::from([("a".to_string(), Arc::new(tree("a", [file("/x", 1)])))]);
        let result = aggregate(&manifest(&["a"]), &tree_set).unwrap();

        let json = serde_json::to_value(&result).unwrap();

        assert!(json.get("trees").is_none());
        assert_eq!(json["layers"][0]["id"], "sha256:a");
        assert!(json["layers"][0].get("tree").is_none());
        assert_eq!(json["efficiency_score"], 1.0);
    }

    #[test]
    fn test_default_jobs() {
        assert!(AnalyzerOptions::default().jobs() >= 1);
        let options = AnalyzerOptions {
            jobs: NonZeroUsize::new(3),
            timeout: None,
        };
        assert_eq!(options.jobs(), 3);
    }
}
