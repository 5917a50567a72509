//! Turns the records of one layer archive into a [`LayerTree`].

use std::sync::Arc;

use log::trace;

use crate::{
    error::{AnalysisError, Result},
    progress::{ProgressEvent, ProgressSink},
    record::{ArchiveRecord, FileRecord},
    tree::LayerTree,
};

/// How many records are processed between two `LayerProgress` events.
pub const PROGRESS_INTERVAL: usize = 1000;

/// Accumulates the records of a single layer archive.
///
/// Each layer gets its own builder; builders share nothing, so several can run at once.
pub struct LayerBuilder {
    tree: LayerTree,
    layer: usize,
    records: usize,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl LayerBuilder {
    /// Creates a builder for the layer archive called `name` (usually `<id>/layer.tar`).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tree: LayerTree::new(name),
            layer: 0,
            records: 0,
            progress: None,
        }
    }

    /// Reports progress to `sink`, identifying this layer as number `layer`.
    pub fn with_progress(mut self, layer: usize, sink: Arc<dyn ProgressSink>) -> Self {
        self.layer = layer;
        self.progress = Some(sink);
        self
    }

    fn emit(&self, event: impl FnOnce(usize, String) -> ProgressEvent) {
        if let Some(sink) = &self.progress {
            sink.event(&event(self.layer, self.tree.name().to_string()));
        }
    }

    /// Adds one record to the layer.
    ///
    /// PAX extended headers are rejected: they are a property of the encoding, never of the
    /// layer content, and an archive that still carries them as members can't be trusted to
    /// describe its files correctly.
    pub fn push(&mut self, record: &ArchiveRecord) -> Result<()> {
        if let Some(class) = record.extended_header_class() {
            return Err(AnalysisError::ArchiveFormat {
                path: record.path.to_string_lossy().into_owned(),
                flag: char::from(record.entry_type.as_byte()),
                class,
            });
        }

        let file = FileRecord::classify(record);
        trace!("{}: {:?} {:?}", self.tree.name(), file.kind, file.path);
        self.tree.insert(file);

        self.records += 1;
        if self.records % PROGRESS_INTERVAL == 0 {
            let records = self.records;
            self.emit(|layer, name| ProgressEvent::LayerProgress {
                layer,
                name,
                records,
            });
        }

        Ok(())
    }

    /// Freezes the tree.
    pub fn finish(self) -> LayerTree {
        let (records, size) = (self.records, self.tree.total_size());
        self.emit(|layer, name| ProgressEvent::LayerFinished {
            layer,
            name,
            records,
            size,
        });
        self.tree
    }

    /// Feeds every record to the builder and returns the finished tree, stopping at the first
    /// bad record.
    pub fn build<'a>(
        mut self,
        records: impl IntoIterator<Item = &'a ArchiveRecord>,
    ) -> Result<LayerTree> {
        self.emit(|layer, name| ProgressEvent::LayerStarted { layer, name });
        for record in records {
            self.push(record)?;
        }
        Ok(self.finish())
    }
}
