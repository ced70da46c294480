//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and run the crawl
//! loop end-to-end, including checkpointing and resumption.

use image_harvest::batch::NoopReporter;
use image_harvest::crawler::{CrawlLimits, CrawlSettings, Crawler, StopReason};
use image_harvest::storage::FrontierStore;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Crawl settings with no pacing, for tests
fn test_settings() -> CrawlSettings {
    CrawlSettings {
        user_agent: "TestBot/1.0".to_string(),
        request_delay: Duration::ZERO,
        max_retries: 2,
        timeout: Duration::from_secs(5),
        respect_robots: false,
        same_domain_only: true,
        checkpoint_every: 1,
    }
}

/// An HTML page; `set_body_raw` sets the content type along with the body
fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

/// Mounts seed -> /p2 -> /p3, each page with one image
async fn mount_chain(server: &MockServer) {
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body><a href="{base}/p2">Next</a><img src="/img/seed.jpg"></body></html>"#
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/p2"))
        .respond_with(html(
            r#"<html><body><a href="/p3">Next</a><img src="/img/p2.jpg"></body></html>"#.to_string(),
        ))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/p3"))
        .respond_with(html(
            r#"<html><body><a href="/">Home</a><img src="/img/p3.jpg"></body></html>"#.to_string(),
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_page_limit_leaves_rest_in_frontier() {
    let server = MockServer::start().await;
    mount_chain(&server).await;
    let base = server.uri();

    let crawler = Crawler::new(test_settings()).unwrap();
    let limits = CrawlLimits {
        max_pages: Some(2),
        max_images: None,
    };

    let (state, result) = crawler
        .crawl(&format!("{base}/"), limits, None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::PageLimit);
    assert_eq!(result.pages_visited, 2);
    assert_eq!(state.visited().len(), 2);
    assert_eq!(state.frontier_len(), 1);
    assert!(state.is_queued(&format!("{base}/p3")));
    assert_eq!(state.image_count(), 2);
    assert!(state.is_consistent());
}

#[tokio::test]
async fn test_resume_never_revisits() {
    let server = MockServer::start().await;
    mount_chain(&server).await;
    let base = server.uri();
    let seed = format!("{base}/");

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");

    // First run stops after one page and checkpoints
    let crawler = Crawler::new(test_settings())
        .unwrap()
        .with_store(FrontierStore::new(&state_path));
    let first_limits = CrawlLimits {
        max_pages: Some(1),
        max_images: None,
    };
    let (_, first) = crawler
        .crawl(&seed, first_limits, None, &NoopReporter)
        .await
        .unwrap();
    assert_eq!(first.pages_visited, 1);

    // Second run resumes from the file
    let saved = FrontierStore::new(&state_path).load().unwrap().unwrap();
    let images_before = saved.image_count();
    assert!(saved.is_visited(&seed));
    assert!(saved.is_consistent());

    let crawler = Crawler::new(test_settings())
        .unwrap()
        .with_store(FrontierStore::new(&state_path));
    let (state, second) = crawler
        .crawl(&seed, CrawlLimits::default(), Some(saved), &NoopReporter)
        .await
        .unwrap();

    assert_eq!(second.stop_reason, StopReason::FrontierExhausted);
    assert_eq!(second.pages_visited, 2);
    assert!(state.image_count() >= images_before);
    assert_eq!(state.image_count(), 3);
    assert_eq!(state.visited().len(), 3);
    assert!(state.is_consistent());

    // The seed page was served exactly once across both runs
    let requests = server.received_requests().await.unwrap();
    let seed_hits = requests.iter().filter(|r| r.url.path() == "/").count();
    assert_eq!(seed_hits, 1);
}

#[tokio::test]
async fn test_failing_page_is_retried_then_recorded() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body><a href="{base}/broken">Broken</a><a href="{base}/ok">Ok</a></body></html>"#
        )))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(html(r#"<img src="/a.png">"#.to_string()))
        .mount(&server)
        .await;

    let crawler = Crawler::new(test_settings()).unwrap();
    let (state, result) = crawler
        .crawl(&format!("{base}/"), CrawlLimits::default(), None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.pages_visited, 2);
    assert_eq!(result.pages_failed, 1);
    assert_eq!(state.failed_pages().len(), 1);
    assert_eq!(state.failed_pages()[0].url, format!("{base}/broken"));
    // Marked visited at dequeue, so it is not retried by a later run
    assert!(state.is_visited(&format!("{base}/broken")));
    assert_eq!(state.image_count(), 1);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let crawler = Crawler::new(test_settings()).unwrap();
    let (_, result) = crawler
        .crawl(&format!("{base}/"), CrawlLimits::default(), None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.pages_failed, 1);
    assert_eq!(result.pages_visited, 0);
}

#[tokio::test]
async fn test_image_limit_stops_crawl() {
    let server = MockServer::start().await;
    mount_chain(&server).await;
    let base = server.uri();

    let crawler = Crawler::new(test_settings()).unwrap();
    let limits = CrawlLimits {
        max_pages: None,
        max_images: Some(1),
    };
    let (state, result) = crawler
        .crawl(&format!("{base}/"), limits, None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::ImageLimit);
    assert_eq!(result.pages_visited, 1);
    assert_eq!(state.image_count(), 1);
}

#[tokio::test]
async fn test_robots_disallow_skips_page() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<a href="{base}/private/x">Secret</a><a href="{base}/public">Public</a>"#
        )))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/private/x"))
        .respond_with(html("<p>secret</p>".to_string()))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(html("<p>public</p>".to_string()))
        .mount(&server)
        .await;

    let settings = CrawlSettings {
        respect_robots: true,
        ..test_settings()
    };
    let crawler = Crawler::new(settings).unwrap();
    let (state, result) = crawler
        .crawl(&format!("{base}/"), CrawlLimits::default(), None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.pages_skipped, 1);
    assert_eq!(result.pages_visited, 2);
    assert!(state.is_visited(&format!("{base}/private/x")));
}

#[tokio::test]
async fn test_external_links_not_followed() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<a href="https://elsewhere.example/page">Away</a>
               <img src="https://cdn.example/photo.jpg">"#
                .to_string(),
        ))
        .mount(&server)
        .await;

    let crawler = Crawler::new(test_settings()).unwrap();
    let (state, result) = crawler
        .crawl(&format!("{base}/"), CrawlLimits::default(), None, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(result.pages_visited, 1);
    assert_eq!(state.frontier_len(), 0);
    // Images may live on any host
    assert_eq!(state.image_urls(), ["https://cdn.example/photo.jpg".to_string()]);
}
