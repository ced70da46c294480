//! Download task model and failure classification

use crate::retry::{is_transient_reqwest, is_transient_status, Retryable};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Extensions kept from the image URL; anything else is saved as `.jpg`
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Why a task was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The destination file is already present
    AlreadyExists,
}

/// Lifecycle of a single download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed(String),
    Skipped(SkipReason),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }
}

/// One image URL to fetch into one destination file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub image_url: String,
    pub destination: PathBuf,
    /// Attempts made so far
    pub attempt: u32,
    pub status: TaskStatus,
}

impl DownloadTask {
    /// Creates a pending task writing into `dir`
    pub fn new(image_url: &str, dir: &Path) -> Self {
        Self {
            image_url: image_url.to_string(),
            destination: dir.join(destination_filename(image_url)),
            attempt: 0,
            status: TaskStatus::Pending,
        }
    }

    /// Temporary path the body is written to before the final rename
    pub fn part_path(&self) -> PathBuf {
        let mut name = self
            .destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        self.destination.with_file_name(name)
    }
}

/// Stable file name for an image URL
///
/// The name is the first 32 hex characters of the URL's SHA-256 followed by
/// the URL's image extension, so the same URL always lands on the same file.
pub fn destination_filename(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}.{}", &digest[..32], image_extension(url))
}

fn image_extension(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();

    path.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}

/// Failure of a single download attempt
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("expected an image, got {0}")]
    NotAnImage(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl Retryable for DownloadError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Network(e) => is_transient_reqwest(e),
            Self::NotAnImage(_) | Self::InvalidUrl(_) | Self::Write(_) | Self::Cancelled => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
