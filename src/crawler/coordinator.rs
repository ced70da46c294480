//! Crawler coordinator - main crawl loop
//!
//! The crawl is breadth-first and sequential: one page at a time, with a
//! mandatory delay between requests. Concurrency lives in the downloader.
//!
//! The loop owns a `CrawlState` for the duration of the call and hands it back
//! at the end; when a `FrontierStore` is attached the state is checkpointed
//! every `checkpoint_every` pages, on cancellation, and when the loop ends.

use crate::batch::{ProgressEvent, ProgressReporter};
use crate::config::CrawlerConfig;
use crate::crawler::fetcher::{build_http_client, fetch_page, FetchOutcome};
use crate::crawler::parser::parse_html;
use crate::retry::{retry_with_backoff, ExponentialBackoff, RetryError};
use crate::robots::{fetch_robots, ParsedRobots};
use crate::state::CrawlState;
use crate::storage::FrontierStore;
use crate::url::{normalize_url, same_host};
use crate::HarvestError;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Upper bound for the page retry backoff
const MAX_BACKOFF_MS: u64 = 30_000;

/// Crawl politeness settings
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub user_agent: String,
    pub request_delay: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
    pub respect_robots: bool,
    pub same_domain_only: bool,
    pub checkpoint_every: u64,
}

impl CrawlSettings {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            request_delay: config.request_delay(),
            max_retries: config.max_retries,
            timeout: config.timeout(),
            respect_robots: config.respect_robots,
            same_domain_only: config.same_domain_only,
            checkpoint_every: config.checkpoint_every.max(1),
        }
    }
}

/// Per-run crawl limits; `None` means unlimited
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlLimits {
    /// Pages to fetch in this run
    pub max_pages: Option<u64>,

    /// Stop once the state holds this many image URLs
    pub max_images: Option<usize>,
}

/// Why the crawl loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FrontierExhausted,
    PageLimit,
    ImageLimit,
    Cancelled,
}

/// Summary of one crawl run
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlResult {
    /// Pages fetched successfully in this run
    pub pages_visited: u64,

    /// Pages whose fetch failed after all retries
    pub pages_failed: u64,

    /// Pages disallowed by robots.txt
    pub pages_skipped: u64,

    /// Image URLs first discovered in this run
    pub new_images: usize,

    /// Image URLs known to the state, including earlier runs
    pub total_images: usize,

    pub frontier_remaining: usize,

    pub stop_reason: StopReason,
}

/// Sequential breadth-first crawler
pub struct Crawler {
    client: Client,
    settings: CrawlSettings,
    store: Option<FrontierStore>,
    cancel: CancellationToken,
}

impl Crawler {
    /// Creates a crawler with its own HTTP client
    ///
    /// # Arguments
    ///
    /// * `settings` - Politeness settings
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - Ready to crawl
    /// * `Err(HarvestError)` - The HTTP client could not be built
    pub fn new(settings: CrawlSettings) -> Result<Self, HarvestError> {
        let client = build_http_client(&settings.user_agent, settings.timeout)?;
        Ok(Self {
            client,
            settings,
            store: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Checkpoints the crawl state to `store` while crawling
    pub fn with_store(mut self, store: FrontierStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the crawl loop
    ///
    /// This method:
    /// 1. Seeds the frontier (or resumes the given state)
    /// 2. Loads robots.txt for the seed host when enabled
    /// 3. Dequeues pages one at a time, pacing requests
    /// 4. Fetches with retry, extracting links and image URLs
    /// 5. Checkpoints and stops at the first limit reached
    ///
    /// Page failures never fail the crawl; only checkpoint failures do.
    ///
    /// # Arguments
    ///
    /// * `seed` - Start URL
    /// * `limits` - Page and image limits for this run
    /// * `state` - State to resume, or `None` for a fresh crawl
    /// * `reporter` - Receives per-page events
    pub async fn crawl(
        &self,
        seed: &str,
        limits: CrawlLimits,
        state: Option<CrawlState>,
        reporter: &dyn ProgressReporter,
    ) -> Result<(CrawlState, CrawlResult), HarvestError> {
        let seed_url = normalize_url(seed)?;
        let mut state = match state {
            Some(mut state) => {
                state.seed_url.get_or_insert_with(|| seed_url.to_string());
                state.enqueue(seed_url.as_str());
                state
            }
            None => CrawlState::new(seed_url.as_str()),
        };

        let robots = if self.settings.respect_robots {
            fetch_robots(&self.client, &seed_url).await
        } else {
            ParsedRobots::allow_all()
        };

        let mut delay = self.settings.request_delay;
        if let Some(crawl_delay) = robots.crawl_delay(&self.settings.user_agent) {
            if crawl_delay > delay {
                tracing::info!("Honouring robots.txt Crawl-delay of {:?}", crawl_delay);
                delay = crawl_delay;
            }
        }

        let backoff = ExponentialBackoff::new(
            self.settings.request_delay.as_millis() as u64,
            MAX_BACKOFF_MS,
        );

        tracing::info!(
            "Crawling from {} ({} queued, {} visited, {} images known)",
            seed_url,
            state.frontier_len(),
            state.visited().len(),
            state.image_count()
        );

        let images_at_start = state.image_count();
        let start_time = Instant::now();
        let mut last_request: Option<Instant> = None;
        let mut since_checkpoint = 0u64;
        let mut pages_fetched = 0u64;
        let mut pages_visited = 0u64;
        let mut pages_failed = 0u64;
        let mut pages_skipped = 0u64;

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if limits.max_pages.map_or(false, |max| pages_fetched >= max) {
                break StopReason::PageLimit;
            }
            if limits
                .max_images
                .map_or(false, |max| state.image_count() >= max)
            {
                break StopReason::ImageLimit;
            }

            let Some(url) = state.next_batch(1).pop() else {
                break StopReason::FrontierExhausted;
            };

            if !robots.is_allowed(&url, &self.settings.user_agent) {
                tracing::info!("URL {} disallowed by robots.txt", url);
                pages_skipped += 1;
                reporter.report(ProgressEvent::PageSkipped { url });
                continue;
            }

            if let Some(last) = last_request {
                let wait = delay.saturating_sub(last.elapsed());
                if !wait.is_zero() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            state.record_failure(&url, "cancelled");
                            break StopReason::Cancelled;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
            last_request = Some(Instant::now());
            pages_fetched += 1;

            let fetched = retry_with_backoff(
                &backoff,
                self.settings.max_retries,
                &self.cancel,
                |_| fetch_page(&self.client, &url),
            )
            .await;

            match fetched {
                Ok((outcome, _attempts)) => {
                    pages_visited += 1;
                    let new_images = self.absorb_page(&mut state, &seed_url, outcome);
                    tracing::debug!("Visited {} ({} new images)", url, new_images);
                    reporter.report(ProgressEvent::PageVisited { url, new_images });
                }
                Err(RetryError::Cancelled) => {
                    state.record_failure(&url, "cancelled");
                    break StopReason::Cancelled;
                }
                Err(RetryError::Exhausted { error, attempts })
                | Err(RetryError::Permanent { error, attempts }) => {
                    pages_failed += 1;
                    let reason = error.to_string();
                    tracing::warn!(
                        "Failed to fetch {} after {} attempt(s): {}",
                        url,
                        attempts,
                        reason
                    );
                    state.record_failure(&url, reason.clone());
                    reporter.report(ProgressEvent::PageFailed { url, reason });
                }
            }

            since_checkpoint += 1;
            if since_checkpoint >= self.settings.checkpoint_every {
                self.checkpoint(&mut state)?;
                since_checkpoint = 0;
            }

            if pages_fetched % 10 == 0 {
                let rate = pages_fetched as f64 / start_time.elapsed().as_secs_f64().max(0.001);
                tracing::info!(
                    "Progress: {} pages crawled, {} in frontier, {} images, {:.2} pages/sec",
                    pages_fetched,
                    state.frontier_len(),
                    state.image_count(),
                    rate
                );
            }
        };

        self.checkpoint(&mut state)?;

        let result = CrawlResult {
            pages_visited,
            pages_failed,
            pages_skipped,
            new_images: state.image_count().saturating_sub(images_at_start),
            total_images: state.image_count(),
            frontier_remaining: state.frontier_len(),
            stop_reason,
        };

        tracing::info!(
            "Crawl stopped ({:?}): {} visited, {} failed, {} skipped, {} new images in {:?}",
            result.stop_reason,
            result.pages_visited,
            result.pages_failed,
            result.pages_skipped,
            result.new_images,
            start_time.elapsed()
        );

        Ok((state, result))
    }

    /// Adds a fetched page's links and images to the state
    ///
    /// Returns the number of previously unseen image URLs.
    fn absorb_page(&self, state: &mut CrawlState, seed_url: &Url, outcome: FetchOutcome) -> usize {
        let (final_url, body) = match outcome {
            FetchOutcome::Html { final_url, body } => (final_url, body),
            FetchOutcome::NotHtml { content_type } => {
                tracing::debug!("Skipping non-HTML content ({})", content_type);
                return 0;
            }
        };

        let parsed = parse_html(&body, &final_url);

        for link in &parsed.links {
            if self.settings.same_domain_only {
                let on_seed_host = Url::parse(link)
                    .map(|link_url| same_host(&link_url, seed_url))
                    .unwrap_or(false);
                if !on_seed_host {
                    continue;
                }
            }
            state.enqueue(link);
        }

        parsed
            .images
            .iter()
            .filter(|image| state.add_image(image))
            .count()
    }

    fn checkpoint(&self, state: &mut CrawlState) -> Result<(), HarvestError> {
        if let Some(store) = &self.store {
            state.touch();
            store.save(state)?;
        }
        Ok(())
    }
}
