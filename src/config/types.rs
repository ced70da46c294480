use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default browser-like user agent used when none is configured
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Main configuration structure for Image-Harvest
///
/// Every section and key has a default, so an empty file (or no file at all)
/// yields a usable configuration. Unknown keys are rejected at load time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub detection: DetectionConfig,
    pub crawler: CrawlerConfig,
    pub downloader: DownloaderConfig,
    pub batch: BatchConfig,
}

/// Filesystem locations used by the pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PathsConfig {
    /// Folder holding the shared face database
    pub database_folder: PathBuf,

    /// Folder of images awaiting manual processing
    pub image_folder: PathBuf,

    /// Folder where the extractor writes cropped faces
    pub cropped_face_folder: PathBuf,

    /// Base folder for downloaded batches
    pub download_folder: PathBuf,

    /// Crawl state checkpoint file
    pub state_file: PathBuf,

    /// SQLite batch history ledger
    pub history_database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database_folder: PathBuf::from("data/database"),
            image_folder: PathBuf::from("data/images"),
            cropped_face_folder: PathBuf::from("data/cropped_faces"),
            download_folder: PathBuf::from("data/downloaded_images"),
            state_file: PathBuf::from("data/crawler_state.json"),
            history_database: PathBuf::from("data/history.db"),
        }
    }
}

/// Face detection settings forwarded to the external extractor
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DetectionConfig {
    /// Minimum detection confidence, in [0, 1]
    pub detection_threshold: f32,

    /// Faces with a smaller bounding box side (pixels) are discarded
    pub min_face_size: f32,

    /// External extractor command line; the image path and batch id are appended
    pub extractor_command: Vec<String>,

    /// Per-image extraction timeout (seconds)
    pub extract_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.8,
            min_face_size: 0.0,
            extractor_command: Vec::new(),
            extract_timeout_secs: 120,
        }
    }
}

impl DetectionConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

/// Crawler politeness settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CrawlerConfig {
    /// User agent sent with page requests
    pub user_agent: String,

    /// Minimum delay between page requests (milliseconds), also the retry backoff base
    pub request_delay_ms: u64,

    /// Retries for a page fetch after the first attempt
    pub max_retries: u32,

    /// Per-request timeout (seconds)
    pub timeout_secs: u64,

    /// Honour robots.txt for the seed host
    pub respect_robots: bool,

    /// Only follow links on the seed's host
    pub same_domain_only: bool,

    /// Checkpoint the crawl state every N pages
    pub checkpoint_every: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_delay_ms: 500,
            max_retries: 3,
            timeout_secs: 30,
            respect_robots: true,
            same_domain_only: true,
            checkpoint_every: 1,
        }
    }
}

impl CrawlerConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Image downloader settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DownloaderConfig {
    /// Size of the download worker pool
    pub concurrent_downloads: usize,

    /// Retries for an image fetch after the first attempt
    pub retry_count: u32,

    /// Per-request timeout (seconds)
    pub timeout_secs: u64,

    /// Overrides the crawler user agent for image requests
    pub user_agent: Option<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: 20,
            retry_count: 3,
            timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl DownloaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Batch processing toggles
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BatchConfig {
    /// Skip images already downloaded or processed
    pub skip_existing: bool,

    /// Move processed images into faces/ or no_faces/
    pub move_processed: bool,

    /// Number of download tasks released to the worker pool at once
    pub batch_size: usize,

    /// Concurrent extraction workers
    pub processing_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            skip_existing: true,
            move_processed: false,
            batch_size: 1000,
            processing_workers: 4,
        }
    }
}
