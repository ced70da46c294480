//! Face extraction boundary
//!
//! Detection and embedding live outside this crate. A `FaceExtractor` turns
//! one image into zero or more `FaceEntry`s or a typed failure; the pipeline
//! only depends on that contract.

use crate::config::DetectionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable carrying the detection threshold to the extractor command
pub const THRESHOLD_ENV: &str = "HARVEST_DETECTION_THRESHOLD";

/// Exit code an extractor command uses for "no face found"
pub const EXIT_NO_FACE: i32 = 2;

/// Exit code an extractor command uses for an image it cannot decode
pub const EXIT_UNREADABLE: i32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Detector output attached to each face
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    /// Detection confidence
    pub score: f32,

    /// Bounding box as `[x, y, width, height]` in pixels
    pub bbox: [f32; 4],

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,

    /// Head pose as `[pitch, yaw, roll]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<[f32; 3]>,
}

impl DetectionMetadata {
    /// Shorter side of the bounding box
    pub fn face_size(&self) -> f32 {
        self.bbox[2].min(self.bbox[3])
    }
}

/// One face stored in the shared database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEntry {
    pub embedding: Vec<f32>,
    pub source_image_path: PathBuf,
    pub batch_id: String,
    #[serde(default)]
    pub detection: DetectionMetadata,
    pub added_at: DateTime<Utc>,
}

/// Why an image produced no entries
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no face found")]
    NoFaceFound,

    #[error("unreadable image: {0}")]
    UnreadableImage(String),

    #[error("extraction failed: {0}")]
    ExtractionError(String),
}

/// Turns an image into face entries
///
/// Implementations are called from blocking worker threads and may take
/// seconds per image.
pub trait FaceExtractor: Send + Sync {
    /// Extracts every face in `image`
    ///
    /// # Arguments
    ///
    /// * `image` - Path to the image file
    /// * `batch_id` - Batch the entries belong to
    ///
    /// # Returns
    ///
    /// * `Ok(entries)` - At least one face was found
    /// * `Err(ExtractError::NoFaceFound)` - The image has no usable face
    /// * `Err(_)` - The image could not be processed
    fn extract(&self, image: &Path, batch_id: &str) -> Result<Vec<FaceEntry>, ExtractError>;
}

/// Runs an external command per image
///
/// The command is invoked as `<program> <args...> <image-path> <batch-id>` and
/// must print a JSON array of faces on stdout, each with an `embedding` and an
/// optional `detection` object. A command still running after the timeout is
/// killed.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    threshold: f32,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct RawFace {
    embedding: Vec<f32>,
    #[serde(default)]
    detection: DetectionMetadata,
}

impl CommandExtractor {
    /// Creates an extractor from an argv; `None` if the argv is empty
    pub fn new(command: &[String], threshold: f32) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            threshold,
            timeout: None,
        })
    }

    /// Kills the command if it runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Creates the extractor configured in `[detection]`, if any
    pub fn from_config(config: &DetectionConfig) -> Option<Self> {
        Self::new(&config.extractor_command, config.detection_threshold)
            .map(|extractor| extractor.with_timeout(config.extract_timeout()))
    }

    /// Waits for `child`, killing it once the timeout has passed
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ExtractError> {
        let failed = |e: std::io::Error| {
            ExtractError::ExtractionError(format!("failed to wait for {}: {}", self.program, e))
        };

        let Some(timeout) = self.timeout else {
            return child.wait().map_err(failed);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(failed)? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                tracing::warn!("Killing {} after {:?}", self.program, timeout);
                // The child may have exited between the poll and the kill
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractError::ExtractionError(format!(
                    "extractor timed out after {timeout:?}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn parse_output(
        &self,
        stdout: &[u8],
        image: &Path,
        batch_id: &str,
    ) -> Result<Vec<FaceEntry>, ExtractError> {
        let raw: Vec<RawFace> = serde_json::from_slice(stdout)
            .map_err(|e| ExtractError::ExtractionError(format!("invalid extractor output: {e}")))?;

        if raw.is_empty() {
            return Err(ExtractError::NoFaceFound);
        }

        let now = Utc::now();
        Ok(raw
            .into_iter()
            .map(|face| FaceEntry {
                embedding: face.embedding,
                source_image_path: image.to_path_buf(),
                batch_id: batch_id.to_string(),
                detection: face.detection,
                added_at: now,
            })
            .collect())
    }
}

impl FaceExtractor for CommandExtractor {
    fn extract(&self, image: &Path, batch_id: &str) -> Result<Vec<FaceEntry>, ExtractError> {
        tracing::trace!("Running {} on {}", self.program, image.display());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .arg(batch_id)
            .env(THRESHOLD_ENV, self.threshold.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExtractError::ExtractionError(format!("failed to run {}: {}", self.program, e))
            })?;

        // Drain both pipes while waiting; a full pipe would stall the command
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = self.wait(&mut child)?;
        let stdout = collect(stdout);
        let stderr = String::from_utf8_lossy(&collect(stderr)).trim().to_string();

        match status.code() {
            Some(0) => self.parse_output(&stdout, image, batch_id),
            Some(EXIT_NO_FACE) => Err(ExtractError::NoFaceFound),
            Some(EXIT_UNREADABLE) => Err(ExtractError::UnreadableImage(stderr)),
            Some(code) => Err(ExtractError::ExtractionError(format!(
                "exit code {code}: {stderr}"
            ))),
            None => Err(ExtractError::ExtractionError(
                "extractor terminated by signal".to_string(),
            )),
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        // A read error leaves whatever arrived before it
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Checks the file's magic bytes for a supported image format
///
/// Non-images are rejected as `UnreadableImage` before the extractor runs.
pub fn sniff_image(path: &Path) -> Result<(), ExtractError> {
    let mut header = [0u8; 12];
    let read = File::open(path)
        .and_then(|mut file| file.read(&mut header))
        .map_err(|e| ExtractError::UnreadableImage(e.to_string()))?;
    let header = &header[..read];

    let known = header.starts_with(&[0xFF, 0xD8, 0xFF])
        || header.starts_with(&[0x89, b'P', b'N', b'G'])
        || header.starts_with(b"GIF8")
        || header.starts_with(b"BM")
        || (header.starts_with(b"RIFF") && header.len() >= 12 && &header[8..12] == b"WEBP");

    if known {
        Ok(())
    } else {
        Err(ExtractError::UnreadableImage(
            "not a supported image format".to_string(),
        ))
    }
}
