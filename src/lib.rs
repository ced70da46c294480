//! Image-Harvest: a resumable web image ingestion pipeline
//!
//! This crate discovers pages, extracts image URLs, downloads the images under
//! bounded concurrency, and hands them to an external face extractor whose
//! entries are appended to a shared face database. Every run is tracked as a
//! named batch in a durable history ledger and can be resumed after interruption.

pub mod batch;
pub mod config;
pub mod crawler;
pub mod download;
pub mod harvest;
pub mod ingest;
pub mod output;
pub mod retry;
pub mod robots;
pub mod state;
pub mod storage;
pub mod url;

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Image-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("Face database error: {0}")]
    Database(#[from] ingest::DatabaseError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("Invalid batch transition: {from} -> {to}")]
    InvalidTransition {
        from: state::BatchStatus,
        to: state::BatchStatus,
    },

    #[error("A batch named '{0}' already exists")]
    DuplicateBatchName(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Invalid batch name '{0}'")]
    InvalidBatchName(String),

    #[error("No crawl state found at {0}")]
    NoCrawlState(PathBuf),

    #[error("Destination {path} is not writable: {source}")]
    DestinationUnwritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No face extractor configured")]
    MissingExtractor,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// Returns true for environment failures that abort the current stage
    ///
    /// Per-item failures (a page that will not load, an image that 404s) never
    /// surface as a `HarvestError`; they are counted against the batch instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::StorageError(_)
                | Self::Database(_)
                | Self::NoCrawlState(_)
                | Self::DestinationUnwritable { .. }
                | Self::MissingExtractor
                | Self::Io(_)
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,
}

/// Result type alias for Image-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use batch::{BatchManager, ProgressEvent, ProgressReporter};
pub use config::Config;
pub use harvest::{Harvester, RunOptions, RunReport};
pub use state::{Batch, BatchStatus, CrawlState};
pub use url::{extract_domain, normalize_url};
