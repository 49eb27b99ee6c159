use std::sync::Arc;

use crate::domain::UploadStatus;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Emitted after every persisted run-status transition.
    StatusChanged {
        run_id: Option<String>,
        status: UploadStatus,
        message: Option<String>,
    },
    /// Emitted while a sequence file streams; `percent` is bytes sent over
    /// total bytes for the sample's file set.
    FileProgress { sample_name: String, percent: u8 },
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Fan-out to any number of attached subscribers. Zero subscribers is a
/// no-op; the core always emits.
#[derive(Default, Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.event(event.clone());
        }
    }
}

impl ProgressSink for SinkSet {
    fn event(&self, event: ProgressEvent) {
        self.emit(event);
    }
}
