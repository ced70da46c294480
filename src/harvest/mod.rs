//! Run orchestration
//!
//! `Harvester` drives one batch through its stages:
//! 1. Crawl from the start URL (or load image URLs from a saved crawl state)
//! 2. Download the image URLs into the batch folder
//! 3. Optionally run the batch folder through the face extractor
//!
//! Per-item failures only move counters. A fatal error marks the batch
//! `Failed` and is returned; a cancelled run ends `PartiallyCompleted`.

use crate::batch::{
    generate_batch_name, BatchManager, CreateOptions, ProgressEvent, ProgressReporter,
};
use crate::config::Config;
use crate::crawler::{CrawlLimits, CrawlResult, CrawlSettings, Crawler};
use crate::download::{DownloadResult, DownloadSettings, Downloader};
use crate::ingest::{
    DatabaseWriter, FaceExtractor, IngestPipeline, JsonLinesDatabase, ProcessOptions,
    ProcessResult,
};
use crate::state::{Batch, BatchStatus};
use crate::storage::{ensure_writable, FrontierStore, SharedHistory};
use crate::url::normalize_url;
use crate::{ConfigError, HarvestError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Parameters of one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Seed URL; required unless crawling is skipped
    pub start_url: Option<String>,

    /// Pages to fetch in this run
    pub max_pages: Option<u64>,

    /// Image URLs to collect and download
    pub max_images: Option<usize>,

    /// Overrides `[batch] batch-size`
    pub batch_size: Option<usize>,

    /// Generated from the current time when `None`
    pub batch_name: Option<String>,

    /// Reuse image URLs from the saved crawl state instead of crawling
    pub skip_crawl: bool,

    /// Only crawl (and optionally process what is already on disk)
    pub skip_download: bool,

    /// Run face extraction on the batch folder after downloading
    pub auto_process: bool,

    /// Overrides `[paths] download-folder`
    pub output_dir: Option<PathBuf>,

    /// Discard any saved crawl state before crawling
    pub fresh: bool,

    /// Replace an existing history entry with the same batch name
    pub overwrite: bool,
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub batch: Batch,
    pub crawl: Option<CrawlResult>,
    pub download: Option<DownloadResult>,
    pub process: Option<ProcessResult>,
    pub cancelled: bool,
}

#[derive(Default)]
struct StageResults {
    crawl: Option<CrawlResult>,
    download: Option<DownloadResult>,
    process: Option<ProcessResult>,
}

/// Pipeline entry point shared by the CLI and library callers
pub struct Harvester {
    config: Config,
    history: SharedHistory,
    extractor: Option<Arc<dyn FaceExtractor>>,
    events: Option<UnboundedSender<ProgressEvent>>,
    cancel: CancellationToken,
    config_hash: Option<String>,
}

impl Harvester {
    pub fn new(config: Config, history: SharedHistory) -> Self {
        Self {
            config,
            history,
            extractor: None,
            events: None,
            cancel: CancellationToken::new(),
            config_hash: None,
        }
    }

    /// Sets the face extractor used by the processing stage
    pub fn with_extractor(mut self, extractor: Arc<dyn FaceExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Forwards every progress event to `events`
    pub fn with_events(mut self, events: UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Records `hash` on every batch this harvester creates
    pub fn with_config_hash(mut self, hash: Option<String>) -> Self {
        self.config_hash = hash;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs a new batch
    ///
    /// # Errors
    ///
    /// Argument errors (no start URL, no extractor for `auto_process`, a bad
    /// or duplicate batch name) are returned before a batch is recorded.
    /// Fatal errors during the run mark the batch `Failed` and are returned.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport, HarvestError> {
        if !options.skip_crawl && options.start_url.is_none() {
            return Err(ConfigError::Validation(
                "a start URL is required unless crawling is skipped".to_string(),
            )
            .into());
        }
        if options.auto_process && self.extractor.is_none() {
            return Err(HarvestError::MissingExtractor);
        }

        let name = options
            .batch_name
            .clone()
            .unwrap_or_else(generate_batch_name);
        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.paths.download_folder.clone());

        let manager = BatchManager::create(
            self.history.clone(),
            Some(&name),
            options.start_url.clone(),
            CreateOptions {
                overwrite: options.overwrite,
                batch_dir: output_dir.join(name.trim()),
                config_hash: self.config_hash.clone(),
            },
            self.events.clone(),
        )?;

        let stages = match self.run_stages(&manager, options).await {
            Ok(stages) => stages,
            Err(e) => return Err(self.fail_batch(&manager, e)),
        };

        let cancelled = self.cancel.is_cancelled();
        manager.finish(cancelled)?;

        Ok(RunReport {
            batch: manager.snapshot(),
            crawl: stages.crawl,
            download: stages.download,
            process: stages.process,
            cancelled,
        })
    }

    /// Re-runs face extraction for a batch from the history
    ///
    /// # Arguments
    ///
    /// * `name` - Batch to reopen
    /// * `image_dir` - Folder to process; defaults to the batch folder
    pub async fn reprocess(
        &self,
        name: &str,
        image_dir: Option<&Path>,
    ) -> Result<RunReport, HarvestError> {
        let extractor = self
            .extractor
            .clone()
            .ok_or(HarvestError::MissingExtractor)?;

        let manager = BatchManager::open(self.history.clone(), name, self.events.clone())?;
        let dir = image_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| manager.snapshot().batch_dir);

        manager.transition(BatchStatus::Processing)?;
        let processed = match self.process_folder(&manager, extractor, &dir).await {
            Ok(processed) => processed,
            Err(e) => return Err(self.fail_batch(&manager, e)),
        };

        let cancelled = self.cancel.is_cancelled();
        manager.finish(cancelled)?;

        Ok(RunReport {
            batch: manager.snapshot(),
            crawl: None,
            download: None,
            process: Some(processed),
            cancelled,
        })
    }

    async fn run_stages(
        &self,
        manager: &BatchManager,
        options: &RunOptions,
    ) -> Result<StageResults, HarvestError> {
        let batch_dir = manager.snapshot().batch_dir;
        ensure_writable(&batch_dir).map_err(|source| HarvestError::DestinationUnwritable {
            path: batch_dir.clone(),
            source,
        })?;

        let mut stages = StageResults::default();

        let mut image_urls = if options.skip_crawl {
            self.load_image_urls()?
        } else {
            manager.transition(BatchStatus::Crawling)?;
            let (urls, crawl) = self.crawl(manager, options).await?;
            stages.crawl = Some(crawl);
            urls
        };

        if let Some(max) = options.max_images {
            image_urls.truncate(max);
        }

        if !options.skip_download && !self.cancel.is_cancelled() {
            manager.transition(BatchStatus::Downloading)?;
            manager.report(ProgressEvent::ImagesLoaded {
                count: image_urls.len(),
            });

            let mut settings = DownloadSettings::from_config(&self.config);
            if let Some(batch_size) = options.batch_size {
                settings.batch_size = batch_size.max(1);
            }
            let downloader = Downloader::new(settings)?.with_cancellation(self.cancel.clone());
            stages.download = Some(downloader.download(&image_urls, &batch_dir, manager).await?);
        }

        if options.auto_process && !self.cancel.is_cancelled() {
            let extractor = self
                .extractor
                .clone()
                .ok_or(HarvestError::MissingExtractor)?;
            manager.transition(BatchStatus::Processing)?;
            stages.process = Some(self.process_folder(manager, extractor, &batch_dir).await?);
        }

        Ok(stages)
    }

    /// Image URLs of the saved crawl state, for skip-crawl runs
    fn load_image_urls(&self) -> Result<Vec<String>, HarvestError> {
        let store = FrontierStore::new(&self.config.paths.state_file);
        let state = store
            .load()?
            .ok_or_else(|| HarvestError::NoCrawlState(store.path().to_path_buf()))?;

        tracing::info!(
            "Skipping crawl; loaded {} image URLs from {}",
            state.image_count(),
            store.path().display()
        );
        Ok(state.image_urls().to_vec())
    }

    async fn crawl(
        &self,
        manager: &BatchManager,
        options: &RunOptions,
    ) -> Result<(Vec<String>, CrawlResult), HarvestError> {
        let start_url = options.start_url.as_deref().unwrap_or_default();
        let seed = normalize_url(start_url)?;
        let store = FrontierStore::new(&self.config.paths.state_file);

        if options.fresh {
            store.clear()?;
        }

        let resumed = match store.load()? {
            Some(state) if state.seed_url.as_deref() == Some(seed.as_str()) => {
                tracing::info!(
                    "Resuming crawl: {} visited, {} queued, {} images",
                    state.visited().len(),
                    state.frontier_len(),
                    state.image_count()
                );
                Some(state)
            }
            Some(state) => {
                tracing::warn!(
                    "Saved crawl state is for {}; starting fresh for {}",
                    state.seed_url.as_deref().unwrap_or("an unknown seed"),
                    seed
                );
                None
            }
            None => None,
        };

        let crawler = Crawler::new(CrawlSettings::from_config(&self.config.crawler))?
            .with_store(store)
            .with_cancellation(self.cancel.clone());

        let limits = CrawlLimits {
            max_pages: options.max_pages,
            max_images: options.max_images,
        };
        let (state, result) = crawler.crawl(seed.as_str(), limits, resumed, manager).await?;
        Ok((state.image_urls().to_vec(), result))
    }

    async fn process_folder(
        &self,
        manager: &BatchManager,
        extractor: Arc<dyn FaceExtractor>,
        dir: &Path,
    ) -> Result<ProcessResult, HarvestError> {
        let database = JsonLinesDatabase::open(&self.config.paths.database_folder)?;
        let writer = DatabaseWriter::spawn(Box::new(database))?;

        let pipeline = IngestPipeline::new(
            extractor,
            writer.handle(),
            self.history.clone(),
            ProcessOptions::from_config(&self.config),
        )
        .with_cancellation(self.cancel.clone());

        let processed = pipeline.process_batch(&manager.name(), dir, manager).await;
        drop(pipeline);

        let entries = writer.shutdown().await?;
        tracing::info!("Face database now holds {} entries", entries);
        processed
    }

    /// Marks the batch `Failed` and hands the error back
    fn fail_batch(&self, manager: &BatchManager, error: HarvestError) -> HarvestError {
        if let Err(e) = manager.fail(&error) {
            tracing::warn!("Could not mark batch '{}' as failed: {}", manager.name(), e);
        }
        error
    }
}
