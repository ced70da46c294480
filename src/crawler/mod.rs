//! Crawler module for page discovery
//!
//! This module contains the crawling logic, including:
//! - HTTP fetching with transient/permanent failure classification
//! - HTML parsing for links and image URLs
//! - The sequential, paced, resumable crawl loop

mod coordinator;
mod fetcher;
mod parser;

pub use coordinator::{CrawlLimits, CrawlResult, CrawlSettings, Crawler, StopReason};
pub use fetcher::{build_http_client, fetch_page, FetchFailure, FetchOutcome};
pub use parser::{parse_html, ParsedPage};
