//! Structured progress events
//!
//! Every stage reports what happened to each item through a `ProgressReporter`.
//! The batch manager turns these events into counter deltas and forwards them
//! to whoever is listening, so no stage knows about presentation.

use crate::state::{BatchCounters, BatchStatus};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    StageChanged {
        batch: String,
        status: BatchStatus,
    },
    PageVisited {
        url: String,
        new_images: usize,
    },
    PageFailed {
        url: String,
        reason: String,
    },
    /// Disallowed by robots.txt
    PageSkipped {
        url: String,
    },
    /// Image URLs handed to the downloader
    ImagesLoaded {
        count: usize,
    },
    ImageDownloaded {
        url: String,
        path: PathBuf,
    },
    DownloadSkipped {
        url: String,
        path: PathBuf,
    },
    DownloadFailed {
        url: String,
        reason: String,
    },
    ImageProcessed {
        path: PathBuf,
        faces_detected: usize,
        faces_added: usize,
    },
    NoFaceFound {
        path: PathBuf,
    },
    /// Already in the processed set; not counted as a result
    ImageAlreadyProcessed {
        path: PathBuf,
    },
    ExtractionFailed {
        path: PathBuf,
        reason: String,
    },
}

/// How an event counts toward a stage's final outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failure,
    Neutral,
}

impl ProgressEvent {
    /// Counter changes implied by this event
    pub fn counter_delta(&self) -> BatchCounters {
        let mut delta = BatchCounters::default();
        match self {
            Self::ImagesLoaded { count } => delta.images_found = *count as u64,
            Self::ImageDownloaded { .. } => delta.images_downloaded = 1,
            Self::DownloadSkipped { .. } => delta.skipped = 1,
            Self::DownloadFailed { .. } => delta.errors = 1,
            Self::ImageProcessed {
                faces_detected,
                faces_added,
                ..
            } => {
                delta.faces_detected = *faces_detected as u64;
                delta.faces_added = *faces_added as u64;
            }
            Self::NoFaceFound { .. } | Self::ImageAlreadyProcessed { .. } => delta.skipped = 1,
            Self::ExtractionFailed { .. } => delta.errors = 1,
            Self::StageChanged { .. }
            | Self::PageVisited { .. }
            | Self::PageFailed { .. }
            | Self::PageSkipped { .. } => {}
        }
        delta
    }

    /// Whether this event is a per-item success or failure of its stage
    ///
    /// A skipped download already exists on disk, so it counts as a success.
    /// An image without a usable face counts against the processing stage.
    pub fn outcome(&self) -> ItemOutcome {
        match self {
            Self::PageVisited { .. }
            | Self::ImageDownloaded { .. }
            | Self::DownloadSkipped { .. }
            | Self::ImageProcessed { .. } => ItemOutcome::Success,
            Self::PageFailed { .. }
            | Self::DownloadFailed { .. }
            | Self::NoFaceFound { .. }
            | Self::ExtractionFailed { .. } => ItemOutcome::Failure,
            Self::StageChanged { .. }
            | Self::PageSkipped { .. }
            | Self::ImagesLoaded { .. }
            | Self::ImageAlreadyProcessed { .. } => ItemOutcome::Neutral,
        }
    }
}

/// Receiver of progress events
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl ProgressReporter for UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching
        let _ = self.send(event);
    }
}
