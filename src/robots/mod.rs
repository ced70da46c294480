//! Robots.txt handling module
//!
//! robots.txt is fetched once per crawl for the seed host and consulted
//! before every page fetch when `respect-robots` is enabled.

mod parser;

pub use parser::ParsedRobots;

use reqwest::{Client, StatusCode};
use url::Url;

/// Fetches robots.txt for the host of `site`
///
/// Anything other than a successful response (missing file, server error,
/// network failure) yields a permissive policy; robots.txt problems never
/// stop a crawl.
///
/// # Arguments
///
/// * `client` - HTTP client carrying the crawler's user agent and timeout
/// * `site` - Any URL on the host whose robots.txt should be read
pub async fn fetch_robots(client: &Client, site: &Url) -> ParsedRobots {
    let mut robots_url = site.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    let response = match client.get(robots_url.as_str()).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Could not fetch {}: {}", robots_url, e);
            return ParsedRobots::allow_all();
        }
    };

    if response.status() != StatusCode::OK {
        tracing::debug!(
            "{} returned {}, allowing all paths",
            robots_url,
            response.status()
        );
        return ParsedRobots::allow_all();
    }

    match response.text().await {
        Ok(body) => {
            tracing::debug!("Loaded robots.txt from {}", robots_url);
            ParsedRobots::from_content(&body)
        }
        Err(e) => {
            tracing::debug!("Could not read {}: {}", robots_url, e);
            ParsedRobots::allow_all()
        }
    }
}
