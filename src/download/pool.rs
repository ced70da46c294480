//! Bounded-concurrency image downloader
//!
//! URLs are released to the worker pool in chunks of `batch_size`. Within a
//! chunk, `concurrency` workers pull tasks from a shared queue until it is
//! empty, and report each finished task back over a channel. Every enqueued
//! task reaches exactly one terminal state, so
//! `succeeded + skipped + failed == enqueued` holds for every result.

use crate::batch::{ProgressEvent, ProgressReporter};
use crate::config::Config;
use crate::crawler::build_http_client;
use crate::download::task::{DownloadError, DownloadTask, SkipReason, TaskStatus};
use crate::ingest::{FACES_DIR, NO_FACES_DIR};
use crate::retry::{parse_retry_after, retry_with_backoff, ExponentialBackoff, RetryError};
use crate::storage::write_atomic;
use crate::HarvestError;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const METADATA_FILE: &str = "metadata.json";
pub const FAILED_URLS_FILE: &str = "failed_urls.json";
pub const STATS_FILE: &str = "download_stats.json";

/// Downloader settings
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry_count: u32,
    pub timeout: Duration,
    pub user_agent: String,
    pub skip_existing: bool,
    /// Base of the exponential retry backoff
    pub backoff_base: Duration,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.downloader.concurrent_downloads.max(1),
            batch_size: config.batch.batch_size.max(1),
            retry_count: config.downloader.retry_count,
            timeout: config.downloader.timeout(),
            user_agent: config
                .downloader
                .user_agent
                .clone()
                .unwrap_or_else(|| config.crawler.user_agent.clone()),
            skip_existing: config.batch.skip_existing,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// A task that ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFailure {
    pub url: String,
    pub reason: String,
}

/// Aggregate outcome of a download run
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    /// URLs passed in, before de-duplication
    pub requested: usize,

    /// Tasks released to the worker pool
    pub enqueued: usize,

    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,

    pub failures: Vec<DownloadFailure>,

    pub elapsed: Duration,

    /// True if the run stopped early on cancellation
    pub cancelled: bool,
}

impl DownloadResult {
    /// Returns true if every enqueued task is accounted for
    pub fn is_balanced(&self) -> bool {
        self.succeeded + self.skipped + self.failed == self.enqueued
    }
}

/// Totals written to `download_stats.json` after each run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub requested: usize,
    pub enqueued: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub elapsed_seconds: f64,
    /// Newly downloaded images per second
    pub images_per_second: f64,
    pub finished_at: DateTime<Utc>,
}

impl DownloadStats {
    fn from_result(result: &DownloadResult) -> Self {
        let elapsed_seconds = result.elapsed.as_secs_f64();
        Self {
            requested: result.requested,
            enqueued: result.enqueued,
            succeeded: result.succeeded,
            skipped: result.skipped,
            failed: result.failed,
            cancelled: result.cancelled,
            elapsed_seconds,
            images_per_second: result.succeeded as f64 / elapsed_seconds.max(0.001),
            finished_at: Utc::now(),
        }
    }
}

/// Entry written to `metadata.json` for each downloaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub url: String,
    pub file_path: PathBuf,
    pub content_type: String,
    pub size: u64,
    pub downloaded_at: DateTime<Utc>,
}

/// A finished task as reported by a worker
struct Completed {
    task: DownloadTask,
    metadata: Option<ImageMetadata>,
}

struct WorkerContext {
    client: Client,
    settings: DownloadSettings,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
}

/// Image downloader with a fixed-size worker pool
pub struct Downloader {
    client: Client,
    settings: DownloadSettings,
    cancel: CancellationToken,
}

impl Downloader {
    /// Creates a downloader with its own HTTP client
    pub fn new(settings: DownloadSettings) -> Result<Self, HarvestError> {
        let client = build_http_client(&settings.user_agent, settings.timeout)?;
        Ok(Self {
            client,
            settings,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Downloads every URL into `destination`
    ///
    /// Per-item failures are recorded in the result and in `failed_urls.json`;
    /// only environment failures (the destination folder or its metadata
    /// cannot be written) return an error.
    ///
    /// # Arguments
    ///
    /// * `urls` - Image URLs; duplicates are dropped, order is kept
    /// * `destination` - Folder the images are written to
    /// * `reporter` - Receives one event per finished task
    pub async fn download(
        &self,
        urls: &[String],
        destination: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<DownloadResult, HarvestError> {
        let start = Instant::now();
        let settings = &self.settings;
        let context = Arc::new(WorkerContext {
            client: self.client.clone(),
            settings: settings.clone(),
            backoff: ExponentialBackoff::new(settings.backoff_base.as_millis() as u64, 30_000),
            cancel: self.cancel.clone(),
        });

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|source| HarvestError::DestinationUnwritable {
                path: destination.to_path_buf(),
                source,
            })?;

        let mut seen = HashSet::new();
        let tasks: Vec<DownloadTask> = urls
            .iter()
            .filter(|url| seen.insert(url.as_str()))
            .map(|url| DownloadTask::new(url, destination))
            .collect();

        let mut result = DownloadResult {
            requested: urls.len(),
            ..Default::default()
        };
        let mut metadata = BTreeMap::new();
        let total = tasks.len();

        tracing::info!(
            "Downloading {} images ({} requested) to {} with {} workers",
            total,
            urls.len(),
            destination.display(),
            settings.concurrency
        );

        for chunk in tasks.chunks(settings.batch_size) {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            result.enqueued += chunk.len();

            let mut outstanding: HashSet<String> =
                chunk.iter().map(|t| t.image_url.clone()).collect();
            let queue = Arc::new(Mutex::new(chunk.iter().cloned().collect::<VecDeque<_>>()));
            let (tx, mut rx) = mpsc::unbounded_channel();

            let mut workers = JoinSet::new();
            for _ in 0..settings.concurrency.min(chunk.len()) {
                workers.spawn(worker(context.clone(), queue.clone(), tx.clone()));
            }
            drop(tx);

            while let Some(done) = rx.recv().await {
                outstanding.remove(&done.task.image_url);
                self.tally(&mut result, &mut metadata, done, reporter);

                let finished = result.succeeded + result.skipped + result.failed;
                if finished % 100 == 0 || finished == total {
                    tracing::info!(
                        "Downloaded {} of {} images ({:.1}%)",
                        finished,
                        total,
                        finished as f64 / total.max(1) as f64 * 100.0
                    );
                }
            }

            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Download worker aborted: {}", e);
                }
            }

            // Tasks lost with an aborted worker still need a terminal state
            for url in outstanding {
                self.record_failure(&mut result, url, "worker aborted".to_string(), reporter);
            }
        }

        if self.cancel.is_cancelled() {
            result.cancelled = true;
        }

        result.elapsed = start.elapsed();

        // The failures and stats files always describe the latest run
        self.write_metadata(destination, metadata)?;
        let failures = serde_json::to_vec_pretty(&result.failures)?;
        write_atomic(&destination.join(FAILED_URLS_FILE), &failures)?;
        let stats = serde_json::to_vec_pretty(&DownloadStats::from_result(&result))?;
        write_atomic(&destination.join(STATS_FILE), &stats)?;

        tracing::info!(
            "Download finished: {} succeeded, {} skipped, {} failed in {:?}",
            result.succeeded,
            result.skipped,
            result.failed,
            result.elapsed
        );

        Ok(result)
    }

    fn tally(
        &self,
        result: &mut DownloadResult,
        metadata: &mut BTreeMap<String, ImageMetadata>,
        done: Completed,
        reporter: &dyn ProgressReporter,
    ) {
        let Completed { task, metadata: meta } = done;
        match task.status {
            TaskStatus::Succeeded => {
                result.succeeded += 1;
                if let Some(meta) = meta {
                    let key = task
                        .destination
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    metadata.insert(key, meta);
                }
                reporter.report(ProgressEvent::ImageDownloaded {
                    url: task.image_url,
                    path: task.destination,
                });
            }
            TaskStatus::Skipped(SkipReason::AlreadyExists) => {
                result.skipped += 1;
                tracing::debug!("Skipping existing {}", task.destination.display());
                reporter.report(ProgressEvent::DownloadSkipped {
                    url: task.image_url,
                    path: task.destination,
                });
            }
            TaskStatus::Failed(reason) => {
                tracing::warn!(
                    "Failed to download {} after {} attempt(s): {}",
                    task.image_url,
                    task.attempt,
                    reason
                );
                self.record_failure(result, task.image_url, reason, reporter);
            }
            TaskStatus::Pending | TaskStatus::InFlight => {
                self.record_failure(
                    result,
                    task.image_url,
                    "task did not finish".to_string(),
                    reporter,
                );
            }
        }
    }

    fn record_failure(
        &self,
        result: &mut DownloadResult,
        url: String,
        reason: String,
        reporter: &dyn ProgressReporter,
    ) {
        result.failed += 1;
        result.failures.push(DownloadFailure {
            url: url.clone(),
            reason: reason.clone(),
        });
        reporter.report(ProgressEvent::DownloadFailed { url, reason });
    }

    /// Merges new entries into the folder's `metadata.json`
    fn write_metadata(
        &self,
        destination: &Path,
        new_entries: BTreeMap<String, ImageMetadata>,
    ) -> Result<(), HarvestError> {
        if new_entries.is_empty() {
            return Ok(());
        }

        let path = destination.join(METADATA_FILE);
        let mut merged: BTreeMap<String, ImageMetadata> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("Replacing unreadable {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        merged.extend(new_entries);

        write_atomic(&path, &serde_json::to_vec_pretty(&merged)?)?;
        Ok(())
    }
}

async fn worker(
    context: Arc<WorkerContext>,
    queue: Arc<Mutex<VecDeque<DownloadTask>>>,
    tx: mpsc::UnboundedSender<Completed>,
) {
    loop {
        let Some(mut task) = queue.lock().await.pop_front() else {
            break;
        };

        let metadata = if context.cancel.is_cancelled() {
            task.status = TaskStatus::Failed("cancelled".to_string());
            None
        } else {
            run_task(&context, &mut task).await
        };

        if tx.send(Completed { task, metadata }).is_err() {
            break;
        }
    }
}

/// Finds an earlier copy of the task's file
///
/// Processing may have moved it into the `faces/` or `no_faces/` subfolder.
async fn existing_copy(task: &DownloadTask) -> Option<PathBuf> {
    let mut candidates = vec![task.destination.clone()];
    if let (Some(dir), Some(name)) = (task.destination.parent(), task.destination.file_name()) {
        candidates.push(dir.join(FACES_DIR).join(name));
        candidates.push(dir.join(NO_FACES_DIR).join(name));
    }

    for candidate in candidates {
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

/// Drives one task to a terminal state
async fn run_task(context: &WorkerContext, task: &mut DownloadTask) -> Option<ImageMetadata> {
    if context.settings.skip_existing {
        if let Some(found) = existing_copy(task).await {
            task.destination = found;
            task.status = TaskStatus::Skipped(SkipReason::AlreadyExists);
            return None;
        }
    }

    if let Err(e) = url::Url::parse(&task.image_url) {
        task.status = TaskStatus::Failed(DownloadError::InvalidUrl(e.to_string()).to_string());
        return None;
    }

    task.status = TaskStatus::InFlight;
    let fetched = retry_with_backoff(
        &context.backoff,
        context.settings.retry_count,
        &context.cancel,
        |_| fetch_image(&context.client, &task.image_url),
    )
    .await;

    let (bytes, content_type) = match fetched {
        Ok(((bytes, content_type), attempts)) => {
            task.attempt = attempts;
            (bytes, content_type)
        }
        Err(RetryError::Cancelled) => {
            task.attempt += 1;
            task.status = TaskStatus::Failed(DownloadError::Cancelled.to_string());
            return None;
        }
        Err(RetryError::Exhausted { error, attempts })
        | Err(RetryError::Permanent { error, attempts }) => {
            task.attempt = attempts;
            task.status = TaskStatus::Failed(error.to_string());
            return None;
        }
    };

    let part = task.part_path();
    let written = async {
        tokio::fs::write(&part, &bytes).await?;
        tokio::fs::rename(&part, &task.destination).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&part).await;
        task.status = TaskStatus::Failed(DownloadError::Write(e).to_string());
        return None;
    }

    task.status = TaskStatus::Succeeded;
    Some(ImageMetadata {
        url: task.image_url.clone(),
        file_path: task.destination.clone(),
        content_type,
        size: bytes.len() as u64,
        downloaded_at: Utc::now(),
    })
}

/// Fetches one image body, once
async fn fetch_image(client: &Client, url: &str) -> Result<(Vec<u8>, String), DownloadError> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        return Err(DownloadError::Status {
            status,
            retry_after: parse_retry_after(response.headers()),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if content_type.to_ascii_lowercase().starts_with("text/html") {
        return Err(DownloadError::NotAnImage(content_type));
    }

    let bytes = response.bytes().await?;
    Ok((bytes.to_vec(), content_type))
}
