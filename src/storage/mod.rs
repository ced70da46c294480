//! Storage module for persisting harvest progress
//!
//! This module handles everything that must survive a restart:
//! - The batch history ledger (SQLite, WAL mode)
//! - The processed-image set used by skip-existing
//! - The crawl state file (JSON, atomically replaced)

mod schema;
mod sqlite;
mod state_file;
mod traits;

pub use sqlite::SqliteHistory;
pub use state_file::{ensure_writable, write_atomic, FrontierStore};
pub use traits::{HistoryStore, ProcessedOutcome, StorageError, StorageResult};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// History store shared between the batch manager and the ingestion workers
pub type SharedHistory = Arc<Mutex<dyn HistoryStore>>;

/// Opens the history database and wraps it for sharing
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SharedHistory)` - Successfully opened history
/// * `Err(StorageError)` - Failed to open the database
pub fn open_history(path: &Path) -> StorageResult<SharedHistory> {
    Ok(Arc::new(Mutex::new(SqliteHistory::new(path)?)))
}

/// An in-memory history, for dry runs and tests
pub fn in_memory_history() -> StorageResult<SharedHistory> {
    Ok(Arc::new(Mutex::new(SqliteHistory::new_in_memory()?)))
}

/// Locks the shared history, turning a poisoned lock into a storage error
pub fn lock_history(
    history: &SharedHistory,
) -> StorageResult<MutexGuard<'_, dyn HistoryStore + 'static>> {
    history
        .lock()
        .map_err(|_| StorageError::Database("history lock poisoned".to_string()))
}
