use crate::state::BatchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-batch outcome counters
///
/// Counters only ever grow during a run; they are advanced by deltas as the
/// stages report progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub images_found: u64,
    pub images_downloaded: u64,
    pub faces_detected: u64,
    pub faces_added: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl BatchCounters {
    /// Adds another set of counters to this one
    pub fn add(&mut self, delta: &BatchCounters) {
        self.images_found += delta.images_found;
        self.images_downloaded += delta.images_downloaded;
        self.faces_detected += delta.faces_detected;
        self.faces_added += delta.faces_added;
        self.errors += delta.errors;
        self.skipped += delta.skipped;
    }

    pub fn is_zero(&self) -> bool {
        *self == BatchCounters::default()
    }
}

/// One named crawl + download + process run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch name
    pub name: String,

    /// Seed URL the batch was started from, if any
    pub source_url: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set when the batch reaches a terminal state
    pub finished_at: Option<DateTime<Utc>>,

    pub status: BatchStatus,

    pub counters: BatchCounters,

    /// Folder holding the batch's downloaded images
    pub batch_dir: PathBuf,

    /// Hash of the configuration file used for the run
    pub config_hash: Option<String>,

    /// Cause of the last fatal failure
    pub last_error: Option<String>,
}

impl Batch {
    /// Creates a new pending batch
    pub fn new(name: impl Into<String>, source_url: Option<String>, batch_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            source_url,
            created_at: Utc::now(),
            finished_at: None,
            status: BatchStatus::Pending,
            counters: BatchCounters::default(),
            batch_dir,
            config_hash: None,
            last_error: None,
        }
    }

    /// Applies a status delta to this in-memory copy
    pub fn apply(&mut self, delta: &StatusDelta) {
        if let Some(status) = delta.status {
            self.status = status;
        }
        self.counters.add(&delta.counters);
        if delta.finished_at.is_some() {
            self.finished_at = delta.finished_at;
        }
        if delta.last_error.is_some() {
            self.last_error = delta.last_error.clone();
        }
    }
}

/// An incremental update to a stored batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDelta {
    /// New status, if it changes
    pub status: Option<BatchStatus>,

    /// Amounts added to the stored counters
    pub counters: BatchCounters,

    pub finished_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

impl StatusDelta {
    /// A delta that only changes the status
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// A delta that only advances counters
    pub fn counters(counters: BatchCounters) -> Self {
        Self {
            counters,
            ..Default::default()
        }
    }
}
