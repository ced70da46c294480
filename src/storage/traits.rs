//! Storage traits and error types
//!
//! This module defines the trait interface for the batch history ledger and
//! the error type shared by the history ledger and the crawl state file.

use crate::state::{Batch, StatusDelta};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State file {path} is corrupt: {message}")]
    CorruptState { path: PathBuf, message: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome recorded for a processed image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedOutcome {
    /// At least one face was appended to the database
    Faces,

    /// The extractor found no usable face
    NoFace,
}

impl ProcessedOutcome {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Faces => "faces",
            Self::NoFace => "no_face",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "faces" => Some(Self::Faces),
            "no_face" => Some(Self::NoFace),
            _ => None,
        }
    }
}

/// Trait for batch history backends
///
/// Implementations must never serve a half-written record to a reader, even
/// while another handle is writing.
pub trait HistoryStore: Send {
    // ===== Batch Records =====

    /// Inserts or replaces a batch record
    fn record(&mut self, batch: &Batch) -> StorageResult<()>;

    /// Lists all batches, newest first
    fn list(&self) -> StorageResult<Vec<Batch>>;

    /// Gets a batch by name
    fn get(&self, name: &str) -> StorageResult<Option<Batch>>;

    /// Removes a batch record
    ///
    /// Only the ledger entry is removed; files and face database entries are
    /// left alone. Returns false if no such batch existed.
    fn delete(&mut self, name: &str) -> StorageResult<bool>;

    /// Applies an incremental update to a stored batch
    ///
    /// Counters in the delta are added to the stored counters.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BatchNotFound` if the batch does not exist.
    fn update(&mut self, name: &str, delta: &StatusDelta) -> StorageResult<()>;

    // ===== Processed Images =====

    /// Records that an image has been processed
    fn mark_processed(
        &mut self,
        image_path: &str,
        batch: &str,
        outcome: ProcessedOutcome,
        faces: u64,
    ) -> StorageResult<()>;

    /// Returns true if the image has already been processed by any batch
    fn is_processed(&self, image_path: &str) -> StorageResult<bool>;

    /// Counts processed images for a batch
    fn count_processed(&self, batch: &str) -> StorageResult<u64>;
}
