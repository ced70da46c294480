//! Resumable crawl progress
//!
//! `CrawlState` is the value the crawler is handed and hands back. It is
//! serialized as JSON to the state file and is the only way a crawl resumes.
//!
//! A URL is marked visited at the moment it is dequeued, not when its fetch
//! completes, so a URL can never be delivered twice even if the process dies
//! between dequeue and visit. Pages whose fetch fails are kept in
//! `failed_pages` and can be re-queued explicitly with [`CrawlState::requeue_failed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// A page that was dequeued but could not be fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPage {
    pub url: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Persisted crawl progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlState {
    /// Seed the crawl was started from
    pub seed_url: Option<String>,

    /// Normalized URLs that have been delivered for visiting
    visited_urls: BTreeSet<String>,

    /// Pending page URLs, visited breadth-first
    #[serde(alias = "to_visit_urls")]
    frontier: VecDeque<String>,

    /// Number of pages delivered for visiting across all runs
    pub pages_visited: u64,

    /// Image URLs in discovery order, without duplicates
    #[serde(alias = "all_image_urls")]
    discovered_image_urls: Vec<String>,

    failed_pages: Vec<FailedPage>,

    pub updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    queued: HashSet<String>,

    #[serde(skip)]
    image_index: HashSet<String>,
}

impl CrawlState {
    /// Creates an empty state with the seed already queued
    pub fn new(seed_url: &str) -> Self {
        let mut state = Self {
            seed_url: Some(seed_url.to_string()),
            ..Default::default()
        };
        state.enqueue(seed_url);
        state
    }

    /// Restores the lookup indexes after deserialization
    ///
    /// Also repairs a state file that violates the frontier invariants: queued
    /// entries that were already visited and duplicate entries are dropped.
    pub fn rebuild_indexes(&mut self) {
        let frontier = std::mem::take(&mut self.frontier);
        self.queued.clear();
        for url in frontier {
            if !self.visited_urls.contains(&url) && self.queued.insert(url.clone()) {
                self.frontier.push_back(url);
            }
        }

        let images = std::mem::take(&mut self.discovered_image_urls);
        self.image_index.clear();
        for url in images {
            if self.image_index.insert(url.clone()) {
                self.discovered_image_urls.push(url);
            }
        }
    }

    /// Queues a page URL for visiting
    ///
    /// Returns false if the URL was already visited or is already queued.
    pub fn enqueue(&mut self, url: &str) -> bool {
        if self.visited_urls.contains(url) || self.queued.contains(url) {
            return false;
        }
        self.queued.insert(url.to_string());
        self.frontier.push_back(url.to_string());
        true
    }

    /// Marks a URL as visited, removing it from the frontier if queued
    pub fn mark_visited(&mut self, url: &str) {
        if self.queued.remove(url) {
            self.frontier.retain(|queued| queued != url);
        }
        self.visited_urls.insert(url.to_string());
    }

    /// Dequeues up to `n` URLs, marking each visited as it is delivered
    pub fn next_batch(&mut self, n: usize) -> Vec<String> {
        let mut batch = Vec::with_capacity(n.min(self.frontier.len()));
        while batch.len() < n {
            let Some(url) = self.frontier.pop_front() else {
                break;
            };
            self.queued.remove(&url);
            self.visited_urls.insert(url.clone());
            self.pages_visited += 1;
            batch.push(url);
        }
        batch
    }

    /// Records a discovered image URL
    ///
    /// Returns false if the URL was already known.
    pub fn add_image(&mut self, url: &str) -> bool {
        if !self.image_index.insert(url.to_string()) {
            return false;
        }
        self.discovered_image_urls.push(url.to_string());
        true
    }

    /// Records a page whose fetch failed after all retries
    pub fn record_failure(&mut self, url: &str, reason: impl Into<String>) {
        self.failed_pages.push(FailedPage {
            url: url.to_string(),
            reason: reason.into(),
            failed_at: Utc::now(),
        });
    }

    /// Moves every failed page back onto the frontier
    ///
    /// Returns the number of pages re-queued.
    pub fn requeue_failed(&mut self) -> usize {
        let failed = std::mem::take(&mut self.failed_pages);
        let mut requeued = 0;
        for page in failed {
            self.visited_urls.remove(&page.url);
            if self.enqueue(&page.url) {
                requeued += 1;
            }
        }
        requeued
    }

    /// Returns true if no URL is both visited and queued
    pub fn is_consistent(&self) -> bool {
        self.frontier
            .iter()
            .all(|url| !self.visited_urls.contains(url))
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.visited_urls.contains(url)
    }

    pub fn is_queued(&self, url: &str) -> bool {
        self.queued.contains(url)
    }

    pub fn visited(&self) -> &BTreeSet<String> {
        &self.visited_urls
    }

    pub fn frontier(&self) -> &VecDeque<String> {
        &self.frontier
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    pub fn image_urls(&self) -> &[String] {
        &self.discovered_image_urls
    }

    pub fn image_count(&self) -> usize {
        self.discovered_image_urls.len()
    }

    pub fn failed_pages(&self) -> &[FailedPage] {
        &self.failed_pages
    }

    /// Stamps the state before a checkpoint
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}
