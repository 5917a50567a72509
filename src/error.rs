use std::{io, time::Duration};

use thiserror::Error;

/// Result type alias for analysis operations.
pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;

/// Everything that can abort an image analysis.
///
/// None of these are retried internally: the input bytes have already been consumed, so a
/// second attempt would see the same thing.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// An archive record carries a header class we refuse to interpret.
    #[error("archive entry {path:?} has unexpected header {flag:?} ({class})")]
    ArchiveFormat {
        path: String,
        flag: char,
        class: &'static str,
    },
    #[error("manifest mismatch: {0}")]
    ManifestMismatch(String),
    #[error("no layer tree was built for manifest layer {0:?}")]
    MissingLayerTree(String),
    /// A layer's size was taken from a different tree than the one it references.
    #[error("layer {index} does not reference the tree its size was computed from")]
    InconsistentLayer { index: usize },
    #[error("failed to parse {path}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse image config {path}")]
    Config {
        path: String,
        #[source]
        source: oci_spec::OciSpecError,
    },
    #[error("failed to read {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),
    #[error("analysis was cancelled")]
    Cancelled,
    #[error("layer build task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl AnalysisError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| AnalysisError::Io { context, source }
    }
}
