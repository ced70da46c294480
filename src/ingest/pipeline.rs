//! Batch ingestion
//!
//! Walks a batch folder, runs the face extractor on every image with a
//! bounded number of workers, and appends the resulting entries through the
//! database writer. An image is marked processed only after its entries are
//! durable, and it is moved (if configured) only after that.

use crate::batch::{ProgressEvent, ProgressReporter};
use crate::config::Config;
use crate::ingest::extractor::{sniff_image, ExtractError, FaceEntry, FaceExtractor};
use crate::ingest::writer::DatabaseHandle;
use crate::storage::{lock_history, ProcessedOutcome, SharedHistory};
use crate::HarvestError;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Subfolder receiving images with at least one face
pub const FACES_DIR: &str = "faces";

/// Subfolder receiving images without a usable face
pub const NO_FACES_DIR: &str = "no_faces";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// Added to the extract timeout before a worker stops waiting, so an
/// extractor that enforces the timeout itself can clean up first
const EXTRACT_GRACE: Duration = Duration::from_secs(5);

/// Ingestion settings
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub skip_existing: bool,
    pub move_processed: bool,
    pub workers: usize,
    /// Faces with a smaller bounding box side are dropped
    pub min_face_size: f32,
    pub extract_timeout: Duration,
}

impl ProcessOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            skip_existing: config.batch.skip_existing,
            move_processed: config.batch.move_processed,
            workers: config.batch.processing_workers.max(1),
            min_face_size: config.detection.min_face_size,
            extract_timeout: config.detection.extract_timeout(),
        }
    }
}

/// An image that could not be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Aggregate outcome of one ingestion run
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    /// Image files found under the folder
    pub images_found: usize,
    /// Images that added at least one face
    pub processed: usize,
    pub no_face: usize,
    pub already_processed: usize,
    pub failed: usize,
    /// Images never started because the run was cancelled
    pub not_started: usize,
    pub faces_detected: u64,
    pub faces_added: u64,
    pub failures: Vec<ProcessFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
enum ImageOutcome {
    Faces { detected: usize, added: usize },
    NoFace,
    AlreadyProcessed,
    Failed(String),
}

struct Completed {
    path: PathBuf,
    outcome: ImageOutcome,
}

struct WorkerContext {
    extractor: Arc<dyn FaceExtractor>,
    database: DatabaseHandle,
    history: SharedHistory,
    options: ProcessOptions,
    batch_id: String,
    image_dir: PathBuf,
}

/// Feeds a batch folder through the face extractor
pub struct IngestPipeline {
    extractor: Arc<dyn FaceExtractor>,
    database: DatabaseHandle,
    history: SharedHistory,
    options: ProcessOptions,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        extractor: Arc<dyn FaceExtractor>,
        database: DatabaseHandle,
        history: SharedHistory,
        options: ProcessOptions,
    ) -> Self {
        Self {
            extractor,
            database,
            history,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Processes every image under `image_dir` for `batch_id`
    ///
    /// A single bad image never aborts the run; it is counted in the result
    /// and reported as `ExtractionFailed`.
    ///
    /// # Arguments
    ///
    /// * `batch_id` - Batch the new entries belong to
    /// * `image_dir` - Folder to scan (recursively, skipping `faces/` and `no_faces/`)
    /// * `reporter` - Receives one event per image
    ///
    /// # Errors
    ///
    /// Returns an error only if `image_dir` cannot be read.
    pub async fn process_batch(
        &self,
        batch_id: &str,
        image_dir: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<ProcessResult, HarvestError> {
        let start = Instant::now();
        let images = collect_images(image_dir)?;
        let total = images.len();

        let mut result = ProcessResult {
            images_found: total,
            ..Default::default()
        };

        tracing::info!(
            "Processing {} images in {} with {} workers",
            total,
            image_dir.display(),
            self.options.workers
        );

        let context = Arc::new(WorkerContext {
            extractor: self.extractor.clone(),
            database: self.database.clone(),
            history: self.history.clone(),
            options: self.options.clone(),
            batch_id: batch_id.to_string(),
            image_dir: image_dir.to_path_buf(),
        });

        let mut outstanding: HashSet<PathBuf> = images.iter().cloned().collect();
        let queue = Arc::new(Mutex::new(images.into_iter().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for _ in 0..self.options.workers.min(total) {
            workers.spawn(worker(
                context.clone(),
                queue.clone(),
                tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(tx);

        while let Some(done) = rx.recv().await {
            outstanding.remove(&done.path);
            tally(&mut result, done, reporter);

            let finished =
                result.processed + result.no_face + result.already_processed + result.failed;
            if finished % 50 == 0 || finished == total {
                tracing::info!("Processed {} of {} images", finished, total);
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Processing worker aborted: {}", e);
            }
        }

        for path in queue.lock().await.drain(..) {
            outstanding.remove(&path);
            result.not_started += 1;
        }
        for path in outstanding {
            tally(
                &mut result,
                Completed {
                    path,
                    outcome: ImageOutcome::Failed("worker aborted".to_string()),
                },
                reporter,
            );
        }

        result.cancelled = self.cancel.is_cancelled();
        result.elapsed = start.elapsed();
        tracing::info!(
            "Processing finished: {} with faces ({} added), {} without, {} already processed, {} failed in {:?}",
            result.processed,
            result.faces_added,
            result.no_face,
            result.already_processed,
            result.failed,
            result.elapsed
        );

        Ok(result)
    }
}

fn tally(result: &mut ProcessResult, done: Completed, reporter: &dyn ProgressReporter) {
    let Completed { path, outcome } = done;
    match outcome {
        ImageOutcome::Faces { detected, added } => {
            result.processed += 1;
            result.faces_detected += detected as u64;
            result.faces_added += added as u64;
            reporter.report(ProgressEvent::ImageProcessed {
                path,
                faces_detected: detected,
                faces_added: added,
            });
        }
        ImageOutcome::NoFace => {
            result.no_face += 1;
            tracing::debug!("No face found in {}", path.display());
            reporter.report(ProgressEvent::NoFaceFound { path });
        }
        ImageOutcome::AlreadyProcessed => {
            result.already_processed += 1;
            reporter.report(ProgressEvent::ImageAlreadyProcessed { path });
        }
        ImageOutcome::Failed(reason) => {
            tracing::warn!("Failed to process {}: {}", path.display(), reason);
            result.failed += 1;
            result.failures.push(ProcessFailure {
                path: path.clone(),
                reason: reason.clone(),
            });
            reporter.report(ProgressEvent::ExtractionFailed { path, reason });
        }
    }
}

async fn worker(
    context: Arc<WorkerContext>,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    tx: mpsc::UnboundedSender<Completed>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(path) = queue.lock().await.pop_front() else {
            break;
        };

        let outcome = process_image(&context, &path).await;
        if tx.send(Completed { path, outcome }).is_err() {
            break;
        }
    }
}

/// Runs one image through extraction, append, bookkeeping, and relocation
async fn process_image(context: &WorkerContext, path: &Path) -> ImageOutcome {
    let key = path.to_string_lossy().into_owned();
    let options = &context.options;

    if options.skip_existing {
        let processed = lock_history(&context.history).and_then(|store| store.is_processed(&key));
        match processed {
            Ok(true) => return ImageOutcome::AlreadyProcessed,
            Ok(false) => {}
            Err(e) => return ImageOutcome::Failed(format!("processed-set lookup failed: {e}")),
        }
    }

    let extracted = match run_extractor(context, path).await {
        Ok(extracted) => extracted,
        Err(reason) => return ImageOutcome::Failed(reason),
    };

    let (outcome, faces) = match extracted {
        Ok(entries) => {
            let detected = entries.len();
            let kept: Vec<FaceEntry> = entries
                .into_iter()
                .filter(|entry| entry.detection.face_size() >= options.min_face_size)
                .collect();

            if kept.is_empty() {
                tracing::debug!(
                    "All {} face(s) in {} are below the minimum size",
                    detected,
                    path.display()
                );
                (ImageOutcome::NoFace, Vec::new())
            } else {
                let added = kept.len();
                (ImageOutcome::Faces { detected, added }, kept)
            }
        }
        Err(ExtractError::NoFaceFound) => (ImageOutcome::NoFace, Vec::new()),
        Err(e) => return ImageOutcome::Failed(e.to_string()),
    };

    if !faces.is_empty() {
        if let Err(e) = context.database.append(faces).await {
            return ImageOutcome::Failed(format!("database append failed: {e}"));
        }
    }

    let (recorded, subdir) = match &outcome {
        ImageOutcome::Faces { added, .. } => ((ProcessedOutcome::Faces, *added as u64), FACES_DIR),
        _ => ((ProcessedOutcome::NoFace, 0), NO_FACES_DIR),
    };
    let marked = lock_history(&context.history).and_then(|mut store| {
        store.mark_processed(&key, &context.batch_id, recorded.0, recorded.1)
    });
    if let Err(e) = marked {
        // Entries may already be in the database; the image is left unmarked and in place
        return ImageOutcome::Failed(format!("could not mark as processed: {e}"));
    }

    if options.move_processed {
        let target_dir = context.image_dir.join(subdir);
        if let Err(e) = relocate(path, &context.image_dir, &target_dir).await {
            tracing::warn!("Could not move {} to {}: {}", path.display(), target_dir.display(), e);
        }
    }

    outcome
}

/// Sniffs and extracts on a blocking thread, bounded by the extract timeout
///
/// The outer error is a failure of the run itself (timeout or a panicked
/// extractor); the inner result is what the extractor reported.
async fn run_extractor(
    context: &WorkerContext,
    path: &Path,
) -> Result<Result<Vec<FaceEntry>, ExtractError>, String> {
    let extractor = context.extractor.clone();
    let batch_id = context.batch_id.clone();
    let image = path.to_path_buf();

    let job = tokio::task::spawn_blocking(move || {
        sniff_image(&image)?;
        extractor.extract(&image, &batch_id)
    });

    let limit = context.options.extract_timeout + EXTRACT_GRACE;
    match tokio::time::timeout(limit, job).await {
        Ok(Ok(extracted)) => Ok(extracted),
        Ok(Err(e)) => Err(format!("extractor panicked: {e}")),
        Err(_) => Err(format!(
            "extraction timed out after {:?}",
            context.options.extract_timeout
        )),
    }
}

/// Moves `path` into `target_dir`, keeping its location relative to `root`
///
/// An existing file is never replaced: a numeric suffix is added to the file
/// stem until the name is free. Copies across filesystems if needed.
async fn relocate(path: &Path, root: &Path, target_dir: &Path) -> std::io::Result<PathBuf> {
    let relative = match path.strip_prefix(root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => PathBuf::from(path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?),
    };

    let target = free_path(&target_dir.join(relative)).await?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(path, &target).await.is_err() {
        tokio::fs::copy(path, &target).await?;
        tokio::fs::remove_file(path).await?;
    }
    Ok(target)
}

/// Returns `wanted`, or `stem_N.ext` for the first N that does not exist
async fn free_path(wanted: &Path) -> std::io::Result<PathBuf> {
    if !tokio::fs::try_exists(wanted).await? {
        return Ok(wanted.to_path_buf());
    }

    let stem = wanted
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = wanted
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1u32.. {
        let candidate = wanted.with_file_name(format!("{stem}_{n}{extension}"));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {}", wanted.display()),
    ))
}

/// Lists image files under `dir`, skipping the `faces/` and `no_faces/` subtrees
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    if !dir.is_dir() {
        return Err(HarvestError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("image folder {} does not exist", dir.display()),
        )));
    }

    let mut images = Vec::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir()
                && matches!(entry.file_name().to_str(), Some(FACES_DIR) | Some(NO_FACES_DIR)))
    });

    for entry in walker {
        let entry = entry.map_err(|e| {
            HarvestError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed")
                    }),
            )
        })?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            images.push(entry.into_path());
        }
    }

    images.sort();
    Ok(images)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_images_skips_sorted_subtrees() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(FACES_DIR)).unwrap();
        std::fs::create_dir_all(root.join(NO_FACES_DIR)).unwrap();
        std::fs::create_dir_all(root.join("nested")).unwrap();

        std::fs::write(root.join("a.jpg"), b"x").unwrap();
        std::fs::write(root.join("b.PNG"), b"x").unwrap();
        std::fs::write(root.join("nested/c.webp"), b"x").unwrap();
        std::fs::write(root.join("metadata.json"), b"{}").unwrap();
        std::fs::write(root.join("d.jpg.part"), b"x").unwrap();
        std::fs::write(root.join(FACES_DIR).join("e.jpg"), b"x").unwrap();
        std::fs::write(root.join(NO_FACES_DIR).join("f.jpg"), b"x").unwrap();

        let images = collect_images(root).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.jpg"),
                PathBuf::from("b.PNG"),
                PathBuf::from("nested/c.webp")
            ]
        );
    }

    #[test]
    fn test_collect_images_missing_folder() {
        let dir = TempDir::new().unwrap();
        assert!(collect_images(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_relocate_moves_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.jpg");
        std::fs::write(&source, b"x").unwrap();

        let target = relocate(&source, dir.path(), &dir.path().join(FACES_DIR))
            .await
            .unwrap();
        assert!(!source.exists());
        assert_eq!(target, dir.path().join(FACES_DIR).join("a.jpg"));
    }

    #[tokio::test]
    async fn test_relocate_keeps_relative_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("x.jpg"), b"top").unwrap();
        std::fs::write(root.join("sub/x.jpg"), b"nested").unwrap();

        let faces = root.join(FACES_DIR);
        let top = relocate(&root.join("x.jpg"), root, &faces).await.unwrap();
        let nested = relocate(&root.join("sub/x.jpg"), root, &faces).await.unwrap();

        assert_eq!(top, faces.join("x.jpg"));
        assert_eq!(nested, faces.join("sub/x.jpg"));
        assert_eq!(std::fs::read(top).unwrap(), b"top");
        assert_eq!(std::fs::read(nested).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_relocate_never_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let faces = root.join(FACES_DIR);
        std::fs::create_dir_all(&faces).unwrap();
        std::fs::write(faces.join("x.jpg"), b"earlier run").unwrap();
        std::fs::write(root.join("x.jpg"), b"this run").unwrap();

        let target = relocate(&root.join("x.jpg"), root, &faces).await.unwrap();

        assert_eq!(target, faces.join("x_1.jpg"));
        assert_eq!(std::fs::read(faces.join("x.jpg")).unwrap(), b"earlier run");
        assert_eq!(std::fs::read(target).unwrap(), b"this run");
    }
}
