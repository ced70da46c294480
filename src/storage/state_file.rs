//! Crawl state file
//!
//! The state file is a JSON document written with write-temp-then-rename, so a
//! crash leaves either the previous checkpoint or the new one, never a mix.

use crate::state::CrawlState;
use crate::storage::traits::{StorageError, StorageResult};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable home of a `CrawlState`
#[derive(Debug, Clone)]
pub struct FrontierStore {
    path: PathBuf,
}

impl FrontierStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the crawl state
    ///
    /// # Returns
    ///
    /// * `Ok(Some(CrawlState))` - State loaded, indexes rebuilt
    /// * `Ok(None)` - No state file exists
    /// * `Err(StorageError::CorruptState)` - The file exists but is not a valid state document
    pub fn load(&self) -> StorageResult<Option<CrawlState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: CrawlState =
            serde_json::from_str(&content).map_err(|e| StorageError::CorruptState {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        state.rebuild_indexes();

        tracing::debug!(
            "Loaded crawl state from {}: {} visited, {} queued, {} images",
            self.path.display(),
            state.visited().len(),
            state.frontier_len(),
            state.image_count()
        );
        Ok(Some(state))
    }

    /// Atomically writes the crawl state
    pub fn save(&self, state: &CrawlState) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &json)?;
        tracing::trace!("Checkpointed crawl state to {}", self.path.display());
        Ok(())
    }

    /// Deletes the state file if present
    pub fn clear(&self) -> StorageResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes `bytes` to `path` through a sibling temporary file and a rename
///
/// Parent folders are created as needed. The temporary file is synced before
/// the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)
}

/// Checks that `dir` exists (creating it if needed) and accepts new files
pub fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scratch = dir.join(".write_check");
    std::fs::write(&scratch, b"")?;
    std::fs::remove_file(&scratch)
}
