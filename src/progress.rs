//! Milestone notifications emitted while an image is analyzed.
//!
//! The analysis itself never prints anything.  Callers that want to show progress implement
//! [`ProgressSink`] (closures work) and attach it to the analyzer.

/// Something noteworthy happened.  `layer` is the 1-based position of the layer archive in the
/// image archive, which is the order layers are discovered in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    LayerStarted {
        layer: usize,
        name: String,
    },
    LayerProgress {
        layer: usize,
        name: String,
        records: usize,
    },
    LayerFinished {
        layer: usize,
        name: String,
        records: usize,
        size: u64,
    },
    /// The outer archive has been read to the end.
    ArchiveScanned { layers: usize },
}

/// Receives [`ProgressEvent`]s.  Called from worker threads, so it must be thread-safe.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: &ProgressEvent) {}
}
