//! HTTP fetcher implementation
//!
//! This module handles page requests for the crawler:
//! - Building HTTP clients with the configured user agent and timeout
//! - GET requests that return HTML bodies
//! - Classifying failures as transient or permanent for the retry policy

use crate::retry::{is_transient_reqwest, is_transient_status, parse_retry_after, Retryable};
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Successful page fetch
#[derive(Debug)]
pub enum FetchOutcome {
    /// An HTML document
    Html {
        /// Final URL after redirects, used as the base for relative links
        final_url: Url,
        body: String,
    },

    /// The response is not HTML; the page is visited but yields no links
    NotHtml { content_type: String },
}

/// Failed page fetch attempt
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("HTTP {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl Retryable for FetchFailure {
    fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Network(e) => is_transient_reqwest(e),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            Self::Network(_) => None,
        }
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - User agent header sent with every request
/// * `timeout` - Per-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use image_harvest::crawler::build_http_client;
/// use std::time::Duration;
///
/// let client = build_http_client("HarvestBot/1.0", Duration::from_secs(30)).unwrap();
/// ```
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches a single page, once
///
/// Retries are the caller's concern; the returned `FetchFailure` says whether
/// another attempt is worthwhile.
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The URL to fetch
pub async fn fetch_page(client: &Client, url: &str) -> Result<FetchOutcome, FetchFailure> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        return Err(FetchFailure::Status {
            status,
            retry_after: parse_retry_after(response.headers()),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    // A missing Content-Type is treated as HTML
    if !content_type.is_empty()
        && !content_type.contains("text/html")
        && !content_type.contains("application/xhtml")
    {
        return Ok(FetchOutcome::NotHtml { content_type });
    }

    let final_url = response.url().clone();
    let body = response.text().await?;
    Ok(FetchOutcome::Html { final_url, body })
}
