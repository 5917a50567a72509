//! Measures how much space the layers of a saved container image waste.
//!
//! Every layer archive of an image is indexed into a [`tree::LayerTree`], the trees are paired
//! with the image's build history, and regular files that a later layer writes again are
//! counted as wasted in the earlier layers.  See [`oci::ImageAnalyzer`] for the entry point.

pub mod builder;
pub mod efficiency;
pub mod error;
pub mod oci;
pub mod progress;
pub mod record;
pub mod tree;


pub use error::{AnalysisError, Result};
pub use oci::{AnalysisResult, AnalyzerOptions, ImageAnalyzer};
