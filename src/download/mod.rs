//! Download queue and worker pool
//!
//! Image URLs become `DownloadTask`s with stable destination paths and are
//! drained by a fixed number of concurrent workers, with per-task retry and
//! skip-existing de-duplication.

mod pool;
mod task;

pub use pool::{
    DownloadFailure, DownloadResult, DownloadSettings, DownloadStats, Downloader, ImageMetadata,
    FAILED_URLS_FILE, METADATA_FILE, STATS_FILE,
};
pub use task::{destination_filename, DownloadError, DownloadTask, SkipReason, TaskStatus};
