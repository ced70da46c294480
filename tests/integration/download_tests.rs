//! Integration tests for the downloader
//!
//! These tests serve images from a wiremock server and check the worker
//! pool's accounting, skip-existing behavior, retries, and side files.

use image_harvest::batch::ProgressEvent;
use image_harvest::download::{
    destination_filename, DownloadFailure, DownloadSettings, DownloadStats, Downloader,
    ImageMetadata, FAILED_URLS_FILE, METADATA_FILE, STATS_FILE,
};
use image_harvest::ingest::{FACES_DIR, NO_FACES_DIR};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

fn test_settings(concurrency: usize, batch_size: usize) -> DownloadSettings {
    DownloadSettings {
        concurrency,
        batch_size,
        retry_count: 2,
        timeout: Duration::from_secs(5),
        user_agent: "TestBot/1.0".to_string(),
        skip_existing: true,
        backoff_base: Duration::from_millis(1),
    }
}

fn jpeg() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_bytes(JPEG_BYTES)
        .insert_header("content-type", "image/jpeg")
}

/// Mounts `/img/{n}.jpg` for each n in `ok`
async fn mount_images(server: &MockServer, ok: impl IntoIterator<Item = usize>) {
    for n in ok {
        Mock::given(method("GET"))
            .and(path(format!("/img/{n}.jpg")))
            .respond_with(jpeg())
            .mount(server)
            .await;
    }
}

fn read_failures(dir: &Path) -> Vec<DownloadFailure> {
    serde_json::from_slice(&std::fs::read(dir.join(FAILED_URLS_FILE)).unwrap()).unwrap()
}

fn image_urls(server: &MockServer, count: usize) -> Vec<String> {
    (0..count)
        .map(|n| format!("{}/img/{n}.jpg", server.uri()))
        .collect()
}

#[tokio::test]
async fn test_one_missing_image_is_a_partial_failure() {
    let server = MockServer::start().await;
    // Image 4 has no mock, so the server answers 404
    mount_images(&server, (0..10).filter(|n| *n != 4)).await;
    let urls = image_urls(&server, 10);

    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(test_settings(4, 5)).unwrap();
    let result = downloader.download(&urls, dir.path(), &tx).await.unwrap();

    assert_eq!(result.succeeded, 9);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.enqueued, 10);
    assert!(result.is_balanced());
    assert_eq!(result.failures[0].url, urls[4]);
    assert!(result.failures[0].reason.contains("404"));

    drop(tx);
    let mut downloaded = 0;
    let mut failed = 0;
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::ImageDownloaded { .. } => downloaded += 1,
            ProgressEvent::DownloadFailed { .. } => failed += 1,
            _ => {}
        }
    }
    assert_eq!((downloaded, failed), (9, 1));

    // Files land under stable names, and no partial files are left behind
    for (n, url) in urls.iter().enumerate() {
        let file = dir.path().join(destination_filename(url));
        assert_eq!(file.exists(), n != 4, "{url}");
    }
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(leftovers, 0);

    // Side files describe what happened
    let metadata: BTreeMap<String, ImageMetadata> =
        serde_json::from_slice(&std::fs::read(dir.path().join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(metadata.len(), 9);
    assert!(metadata.values().all(|m| m.content_type == "image/jpeg"));

    assert_eq!(read_failures(dir.path()).len(), 1);

    let stats: DownloadStats =
        serde_json::from_slice(&std::fs::read(dir.path().join(STATS_FILE)).unwrap()).unwrap();
    assert_eq!((stats.enqueued, stats.succeeded, stats.failed), (10, 9, 1));
}

#[tokio::test]
async fn test_rerun_skips_existing_files() {
    let server = MockServer::start().await;
    mount_images(&server, 0..6).await;
    let urls = image_urls(&server, 6);
    let dir = TempDir::new().unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(test_settings(3, 4)).unwrap();

    let first = downloader.download(&urls, dir.path(), &tx).await.unwrap();
    assert_eq!(first.succeeded, 6);

    let second = downloader.download(&urls, dir.path(), &tx).await.unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 6);
    assert_eq!(second.failed, 0);
    assert!(second.is_balanced());

    // The second run made no requests
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_duplicates_are_downloaded_once() {
    let server = MockServer::start().await;
    mount_images(&server, 0..2).await;
    let mut urls = image_urls(&server, 2);
    urls.push(urls[0].clone());

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = Downloader::new(test_settings(2, 10))
        .unwrap()
        .download(&urls, dir.path(), &tx)
        .await
        .unwrap();

    assert_eq!(result.requested, 3);
    assert_eq!(result.enqueued, 2);
    assert_eq!(result.succeeded, 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(jpeg())
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let urls = vec![format!("{}/flaky.jpg", server.uri())];
    let result = Downloader::new(test_settings(1, 1))
        .unwrap()
        .download(&urls, dir.path(), &tx)
        .await
        .unwrap();

    assert_eq!(result.succeeded, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_html_instead_of_image_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/login.jpg"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<html>Please log in</html>", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let urls = vec![
        format!("{}/login.jpg", server.uri()),
        "not a url".to_string(),
    ];
    let result = Downloader::new(test_settings(2, 5))
        .unwrap()
        .download(&urls, dir.path(), &tx)
        .await
        .unwrap();

    assert_eq!(result.failed, 2);
    assert_eq!(result.succeeded, 0);
    assert!(result.is_balanced());
}

#[tokio::test]
async fn test_clean_rerun_replaces_failure_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/0.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_images(&server, 0..2).await;
    let urls = image_urls(&server, 2);

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(test_settings(1, 2)).unwrap();

    let first = downloader.download(&urls, dir.path(), &tx).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(read_failures(dir.path()).len(), 1);

    let second = downloader.download(&urls, dir.path(), &tx).await.unwrap();
    assert_eq!((second.succeeded, second.skipped, second.failed), (1, 1, 0));
    assert!(read_failures(dir.path()).is_empty());
}

#[tokio::test]
async fn test_sorted_images_are_not_downloaded_again() {
    let server = MockServer::start().await;
    mount_images(&server, 0..3).await;
    let urls = image_urls(&server, 3);

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(test_settings(2, 3)).unwrap();
    downloader.download(&urls, dir.path(), &tx).await.unwrap();

    // Processing sorted two of the images into subfolders
    for (url, subdir) in urls.iter().zip([FACES_DIR, NO_FACES_DIR]) {
        let name = destination_filename(url);
        std::fs::create_dir_all(dir.path().join(subdir)).unwrap();
        std::fs::rename(dir.path().join(&name), dir.path().join(subdir).join(&name)).unwrap();
    }

    let rerun = downloader.download(&urls, dir.path(), &tx).await.unwrap();
    assert_eq!(rerun.skipped, 3);
    assert_eq!(rerun.succeeded, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert!(!dir.path().join(destination_filename(&urls[0])).exists());
}

#[tokio::test]
async fn test_cancellation_fails_in_flight_tasks() {
    let server = MockServer::start().await;
    mount_images(&server, 0..2).await;
    for n in 2..4 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{n}.jpg")))
            .respond_with(jpeg().set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
    }
    let urls = image_urls(&server, 4);

    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let downloader = Downloader::new(test_settings(2, 4))
        .unwrap()
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = downloader.download(&urls, dir.path(), &tx).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(result.cancelled);
    assert_eq!(result.enqueued, 4);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 2);
    assert!(result.is_balanced());
    assert!(result.failures.iter().all(|f| f.reason == "cancelled"));
}
