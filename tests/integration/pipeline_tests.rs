//! Integration tests for batch ingestion
//!
//! These tests run the ingestion pipeline against a scripted face extractor
//! and check batch outcomes, counters, the shared database, and the full
//! crawl + download + process run.

use chrono::Utc;
use image_harvest::batch::{BatchManager, CreateOptions};
use image_harvest::config::Config;
use image_harvest::harvest::{Harvester, RunOptions};
use image_harvest::ingest::{
    read_entries, DatabaseWriter, DetectionMetadata, ExtractError, FaceEntry, FaceExtractor,
    IngestPipeline, JsonLinesDatabase, ProcessOptions, ProcessResult, FACES_DIR, NO_FACES_DIR,
};
use image_harvest::download::FAILED_URLS_FILE;
use image_harvest::state::{Batch, BatchStatus, StatusDelta};
use image_harvest::storage::{
    in_memory_history, lock_history, HistoryStore, ProcessedOutcome, SharedHistory,
    SqliteHistory, StorageError, StorageResult,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

/// Finds one face per image unless the file name contains `noface`
struct ScriptedExtractor;

impl FaceExtractor for ScriptedExtractor {
    fn extract(&self, image: &Path, batch_id: &str) -> Result<Vec<FaceEntry>, ExtractError> {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("noface") {
            return Err(ExtractError::NoFaceFound);
        }

        Ok(vec![FaceEntry {
            embedding: vec![0.25; 8],
            source_image_path: image.to_path_buf(),
            batch_id: batch_id.to_string(),
            detection: DetectionMetadata {
                score: 0.97,
                bbox: [10.0, 10.0, 64.0, 64.0],
                ..Default::default()
            },
            added_at: Utc::now(),
        }])
    }
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html")
}

fn jpeg() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(JPEG_BYTES, "image/jpeg")
}

/// Config with every path under `dir` and no crawl pacing
fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.state_file = dir.join("state.json");
    config.paths.download_folder = dir.join("downloads");
    config.paths.database_folder = dir.join("db");
    config.crawler.request_delay_ms = 0;
    config.crawler.respect_robots = false;
    config
}

/// Serves a seed page linking `/photos/{n}.jpg` for each n in `photos`
async fn mount_gallery(server: &MockServer, photos: std::ops::Range<usize>) {
    let body: String = photos
        .map(|n| format!(r#"<img src="/photos/{n}.jpg">"#))
        .collect();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!("<html><body>{body}</body></html>")))
        .mount(server)
        .await;
}

/// History whose processed-set writes always fail
struct UnmarkableHistory(SqliteHistory);

impl HistoryStore for UnmarkableHistory {
    fn record(&mut self, batch: &Batch) -> StorageResult<()> {
        self.0.record(batch)
    }

    fn list(&self) -> StorageResult<Vec<Batch>> {
        self.0.list()
    }

    fn get(&self, name: &str) -> StorageResult<Option<Batch>> {
        self.0.get(name)
    }

    fn delete(&mut self, name: &str) -> StorageResult<bool> {
        self.0.delete(name)
    }

    fn update(&mut self, name: &str, delta: &StatusDelta) -> StorageResult<()> {
        self.0.update(name, delta)
    }

    fn mark_processed(
        &mut self,
        _image_path: &str,
        _batch: &str,
        _outcome: ProcessedOutcome,
        _faces: u64,
    ) -> StorageResult<()> {
        Err(StorageError::Database("disk I/O error".to_string()))
    }

    fn is_processed(&self, image_path: &str) -> StorageResult<bool> {
        self.0.is_processed(image_path)
    }

    fn count_processed(&self, batch: &str) -> StorageResult<u64> {
        self.0.count_processed(batch)
    }
}

fn options() -> ProcessOptions {
    ProcessOptions {
        skip_existing: true,
        move_processed: false,
        workers: 4,
        min_face_size: 0.0,
        extract_timeout: Duration::from_secs(10),
    }
}

fn write_images(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, JPEG_BYTES).unwrap();
    }
}

/// Runs one processing stage for a new batch and finishes it
async fn process(
    history: &SharedHistory,
    name: &str,
    images: &Path,
    database: &Path,
    options: ProcessOptions,
) -> (ProcessResult, Batch) {
    let manager = BatchManager::create(
        history.clone(),
        Some(name),
        None,
        CreateOptions {
            overwrite: true,
            batch_dir: images.to_path_buf(),
            config_hash: None,
        },
        None,
    )
    .unwrap();
    manager.transition(BatchStatus::Processing).unwrap();

    let database = JsonLinesDatabase::open(database).unwrap();
    let writer = DatabaseWriter::spawn(Box::new(database)).unwrap();
    let pipeline = IngestPipeline::new(
        Arc::new(ScriptedExtractor),
        writer.handle(),
        history.clone(),
        options,
    );
    let result = pipeline
        .process_batch(name, images, &manager)
        .await
        .unwrap();
    drop(pipeline);
    writer.shutdown().await.unwrap();

    manager.finish(false).unwrap();
    (result, manager.snapshot())
}

#[tokio::test]
async fn test_images_without_faces_make_partial_batch() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(
        &images,
        &["a.jpg", "b.jpg", "c.png", "noface1.jpg", "noface2.jpg"],
    );
    let history = in_memory_history().unwrap();

    let (result, batch) = process(&history, "b1", &images, &database, options()).await;

    assert_eq!(result.processed, 3);
    assert_eq!(result.no_face, 2);
    assert_eq!(batch.counters.faces_added, 3);
    assert_eq!(batch.counters.faces_detected, 3);
    assert_eq!(batch.counters.skipped, 2);
    assert_eq!(batch.counters.errors, 0);
    assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    assert_eq!(read_entries(&database).unwrap().len(), 3);

    let stored = lock_history(&history).unwrap().get("b1").unwrap().unwrap();
    assert_eq!(stored.counters, batch.counters);
    assert_eq!(lock_history(&history).unwrap().count_processed("b1").unwrap(), 5);
}

#[tokio::test]
async fn test_all_success_completes_and_all_failure_fails() {
    let dir = TempDir::new().unwrap();
    let database = dir.path().join("db");
    let history = in_memory_history().unwrap();

    let good = dir.path().join("good");
    write_images(&good, &["a.jpg", "b.jpg"]);
    let (_, batch) = process(&history, "good", &good, &database, options()).await;
    assert_eq!(batch.status, BatchStatus::Completed);

    // Files with image extensions but no image content are unreadable
    let bad = dir.path().join("bad");
    std::fs::create_dir_all(&bad).unwrap();
    std::fs::write(bad.join("x.jpg"), b"<html>not an image</html>").unwrap();
    std::fs::write(bad.join("y.png"), b"").unwrap();
    let (result, batch) = process(&history, "bad", &bad, &database, options()).await;

    assert_eq!(result.failed, 2);
    assert_eq!(batch.counters.errors, 2);
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(read_entries(&database).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_lose_no_entries() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    let names: Vec<String> = (0..40).map(|n| format!("img{n:02}.jpg")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    write_images(&images, &refs);
    let history = in_memory_history().unwrap();

    let opts = ProcessOptions {
        workers: 8,
        ..options()
    };
    let (result, batch) = process(&history, "b1", &images, &database, opts).await;

    assert_eq!(result.processed, 40);
    assert_eq!(batch.counters.faces_added, 40);
    assert_eq!(read_entries(&database).unwrap().len(), 40);
}

#[tokio::test]
async fn test_skip_existing_does_not_reprocess() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(&images, &["a.jpg", "noface.jpg"]);
    let history = in_memory_history().unwrap();

    process(&history, "first", &images, &database, options()).await;
    let (result, batch) = process(&history, "second", &images, &database, options()).await;

    assert_eq!(result.already_processed, 2);
    assert_eq!(result.processed, 0);
    assert_eq!(batch.counters.faces_added, 0);
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(read_entries(&database).unwrap().len(), 1);
}

#[tokio::test]
async fn test_small_faces_are_filtered() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(&images, &["a.jpg"]);
    let history = in_memory_history().unwrap();

    let opts = ProcessOptions {
        min_face_size: 100.0,
        ..options()
    };
    let (result, batch) = process(&history, "b1", &images, &database, opts).await;

    assert_eq!(result.no_face, 1);
    assert_eq!(batch.counters.faces_added, 0);
    assert!(read_entries(&database).unwrap().is_empty());
}

#[tokio::test]
async fn test_move_processed_sorts_images() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(&images, &["a.jpg", "noface.jpg"]);
    let history = in_memory_history().unwrap();

    let opts = ProcessOptions {
        move_processed: true,
        ..options()
    };
    process(&history, "b1", &images, &database, opts).await;

    assert!(images.join(FACES_DIR).join("a.jpg").exists());
    assert!(images.join(NO_FACES_DIR).join("noface.jpg").exists());
    assert!(!images.join("a.jpg").exists());
    assert!(!images.join("noface.jpg").exists());
}

#[tokio::test]
async fn test_full_run_crawls_downloads_and_processes() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body>
            <img src="/photos/1.jpg">
            <img src="{base}/photos/2.jpg">
            <a href="/gallery">Gallery</a>
            </body></html>"#
        )))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/gallery"))
        .respond_with(html(r#"<img data-src="/photos/3.jpg">"#.to_string()))
        .mount(&server)
        .await;

    for n in 1..=3 {
        Mock::given(method("GET"))
            .and(path(format!("/photos/{n}.jpg")))
            .respond_with(jpeg())
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let history = in_memory_history().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let harvester = Harvester::new(config, history.clone())
        .with_extractor(Arc::new(ScriptedExtractor))
        .with_events(tx);

    let options = RunOptions {
        start_url: Some(format!("{base}/")),
        batch_name: Some("gallery".to_string()),
        auto_process: true,
        ..Default::default()
    };
    let report = harvester.run(&options).await.unwrap();

    assert_eq!(report.crawl.as_ref().map(|c| c.pages_visited), Some(2));
    assert_eq!(report.download.as_ref().map(|d| d.succeeded), Some(3));
    assert_eq!(report.process.as_ref().map(|p| p.faces_added), Some(3));
    assert_eq!(report.batch.status, BatchStatus::Completed);
    assert_eq!(report.batch.counters.images_found, 3);
    assert_eq!(report.batch.counters.images_downloaded, 3);
    assert_eq!(report.batch.counters.faces_added, 3);
    assert!(report.batch.batch_dir.ends_with("gallery"));
    assert_eq!(read_entries(&dir.path().join("db")).unwrap().len(), 3);

    let stored = lock_history(&history).unwrap().get("gallery").unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Completed);
    assert!(stored.finished_at.is_some());

    // Stage changes arrive in lifecycle order
    drop(harvester);
    let mut stages = Vec::new();
    while let Some(event) = rx.recv().await {
        if let image_harvest::ProgressEvent::StageChanged { status, .. } = event {
            stages.push(status);
        }
    }
    assert_eq!(
        stages,
        vec![
            BatchStatus::Crawling,
            BatchStatus::Downloading,
            BatchStatus::Processing,
            BatchStatus::Completed
        ]
    );

    // A second run with the same name is rejected
    let again = Harvester::new(Config::default(), history)
        .run(&RunOptions {
            skip_crawl: true,
            batch_name: Some("gallery".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(
        again,
        Err(image_harvest::HarvestError::DuplicateBatchName(_))
    ));
}

#[tokio::test]
async fn test_move_keeps_images_with_the_same_name() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(&images, &["x.jpg", "sub/x.jpg"]);
    std::fs::write(images.join("sub/x.jpg"), [JPEG_BYTES, b"nested"].concat()).unwrap();
    let history = in_memory_history().unwrap();

    let opts = ProcessOptions {
        move_processed: true,
        ..options()
    };
    let (result, _) = process(&history, "b1", &images, &database, opts).await;

    assert_eq!(result.processed, 2);
    let faces = images.join(FACES_DIR);
    assert_eq!(std::fs::read(faces.join("x.jpg")).unwrap(), JPEG_BYTES);
    assert!(std::fs::read(faces.join("sub/x.jpg")).unwrap().ends_with(b"nested"));
}

#[tokio::test]
async fn test_unrecorded_image_is_a_failure_and_stays_put() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    let database = dir.path().join("db");
    write_images(&images, &["a.jpg"]);
    let history: SharedHistory = Arc::new(Mutex::new(UnmarkableHistory(
        SqliteHistory::new_in_memory().unwrap(),
    )));

    let opts = ProcessOptions {
        move_processed: true,
        ..options()
    };
    let (result, batch) = process(&history, "b1", &images, &database, opts).await;

    assert_eq!(result.processed, 0);
    assert_eq!(result.failed, 1);
    assert!(result.failures[0].reason.contains("processed"));
    assert_eq!(batch.counters.errors, 1);
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(images.join("a.jpg").exists());
    assert!(!images.join(FACES_DIR).exists());
}

#[tokio::test]
async fn test_download_failure_makes_run_partial() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_gallery(&server, 1..4).await;
    // Photo 3 has no mock and answers 404
    for n in 1..3 {
        Mock::given(method("GET"))
            .and(path(format!("/photos/{n}.jpg")))
            .respond_with(jpeg())
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.downloader.retry_count = 0;
    let history = in_memory_history().unwrap();
    let harvester = Harvester::new(config, history.clone())
        .with_extractor(Arc::new(ScriptedExtractor));

    let report = harvester
        .run(&RunOptions {
            start_url: Some(format!("{base}/")),
            batch_name: Some("partial".to_string()),
            auto_process: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.download.as_ref().map(|d| d.failed), Some(1));
    assert_eq!(report.process.as_ref().map(|p| p.failed), Some(0));
    assert_eq!(report.batch.counters.errors, 1);
    assert_eq!(report.batch.counters.faces_added, 2);
    assert_eq!(report.batch.status, BatchStatus::PartiallyCompleted);

    let stored = lock_history(&history).unwrap().get("partial").unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::PartiallyCompleted);
}

#[tokio::test]
async fn test_cancelled_run_checkpoints_and_ends_partial() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_gallery(&server, 0..4).await;
    for n in 0..4 {
        let response = if n < 2 {
            jpeg()
        } else {
            jpeg().set_delay(Duration::from_secs(30))
        };
        Mock::given(method("GET"))
            .and(path(format!("/photos/{n}.jpg")))
            .respond_with(response)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.downloader.concurrent_downloads = 2;
    let state_file = config.paths.state_file.clone();

    let history = in_memory_history().unwrap();
    let cancel = CancellationToken::new();
    let harvester = Harvester::new(config, history.clone())
        .with_extractor(Arc::new(ScriptedExtractor))
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let report = harvester
        .run(&RunOptions {
            start_url: Some(format!("{base}/")),
            batch_name: Some("stopped".to_string()),
            auto_process: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(report.cancelled);
    assert_eq!(report.batch.status, BatchStatus::PartiallyCompleted);
    assert!(report.process.is_none());

    let download = report.download.unwrap();
    assert_eq!(download.enqueued, 4);
    assert_eq!((download.succeeded, download.failed, download.skipped), (2, 2, 0));
    assert!(download.is_balanced());
    assert!(download.failures.iter().all(|f| f.reason == "cancelled"));
    assert!(report.batch.batch_dir.join(FAILED_URLS_FILE).exists());

    // The crawl state was checkpointed before the download started
    assert!(state_file.exists());

    let stored = lock_history(&history).unwrap().get("stopped").unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::PartiallyCompleted);
    assert!(stored.finished_at.is_some());
}
