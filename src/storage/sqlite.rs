//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the HistoryStore trait.
//! The database runs in WAL mode so readers see the last committed record while
//! a writer is active.

use crate::state::{Batch, BatchCounters, BatchStatus, StatusDelta};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{HistoryStore, ProcessedOutcome, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

const BATCH_COLUMNS: &str = "name, source_url, created_at, finished_at, status, images_found,
     images_downloaded, faces_detected, faces_added, errors, skipped, batch_dir,
     config_hash, last_error";

/// SQLite history backend
pub struct SqliteHistory {
    conn: Connection,
}

impl SqliteHistory {
    /// Opens or creates the history database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file; parent folders are created
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteHistory)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        tracing::debug!("Opened history database at {}", path.display());
        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    let created_at: String = row.get(2)?;
    let finished_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let batch_dir: String = row.get(11)?;

    Ok(Batch {
        name: row.get(0)?,
        source_url: row.get(1)?,
        created_at: parse_timestamp(2, &created_at)?,
        finished_at: finished_at
            .as_deref()
            .map(|value| parse_timestamp(3, value))
            .transpose()?,
        status: BatchStatus::from_db_string(&status).unwrap_or(BatchStatus::Failed),
        counters: BatchCounters {
            images_found: row.get::<_, i64>(5)? as u64,
            images_downloaded: row.get::<_, i64>(6)? as u64,
            faces_detected: row.get::<_, i64>(7)? as u64,
            faces_added: row.get::<_, i64>(8)? as u64,
            errors: row.get::<_, i64>(9)? as u64,
            skipped: row.get::<_, i64>(10)? as u64,
        },
        batch_dir: PathBuf::from(batch_dir),
        config_hash: row.get(12)?,
        last_error: row.get(13)?,
    })
}

impl HistoryStore for SqliteHistory {
    // ===== Batch Records =====

    fn record(&mut self, batch: &Batch) -> StorageResult<()> {
        let c = &batch.counters;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO batches ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                BATCH_COLUMNS
            ),
            params![
                batch.name,
                batch.source_url,
                batch.created_at.to_rfc3339(),
                batch.finished_at.map(|dt| dt.to_rfc3339()),
                batch.status.to_db_string(),
                c.images_found as i64,
                c.images_downloaded as i64,
                c.faces_detected as i64,
                c.faces_added as i64,
                c.errors as i64,
                c.skipped as i64,
                batch.batch_dir.to_string_lossy(),
                batch.config_hash,
                batch.last_error,
            ],
        )?;
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<Batch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM batches ORDER BY created_at DESC, name ASC",
            BATCH_COLUMNS
        ))?;

        let batches = stmt
            .query_map([], row_to_batch)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(batches)
    }

    fn get(&self, name: &str) -> StorageResult<Option<Batch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM batches WHERE name = ?1",
            BATCH_COLUMNS
        ))?;

        let batch = stmt.query_row(params![name], row_to_batch).optional()?;
        Ok(batch)
    }

    fn delete(&mut self, name: &str) -> StorageResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM batches WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    fn update(&mut self, name: &str, delta: &StatusDelta) -> StorageResult<()> {
        let c = &delta.counters;
        let updated = self.conn.execute(
            "UPDATE batches SET
                status = COALESCE(?2, status),
                images_found = images_found + ?3,
                images_downloaded = images_downloaded + ?4,
                faces_detected = faces_detected + ?5,
                faces_added = faces_added + ?6,
                errors = errors + ?7,
                skipped = skipped + ?8,
                finished_at = COALESCE(?9, finished_at),
                last_error = COALESCE(?10, last_error)
             WHERE name = ?1",
            params![
                name,
                delta.status.map(|s| s.to_db_string()),
                c.images_found as i64,
                c.images_downloaded as i64,
                c.faces_detected as i64,
                c.faces_added as i64,
                c.errors as i64,
                c.skipped as i64,
                delta.finished_at.map(|dt| dt.to_rfc3339()),
                delta.last_error,
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::BatchNotFound(name.to_string()));
        }
        Ok(())
    }

    // ===== Processed Images =====

    fn mark_processed(
        &mut self,
        image_path: &str,
        batch: &str,
        outcome: ProcessedOutcome,
        faces: u64,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT OR REPLACE INTO processed_images (image_path, batch_name, outcome, faces, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![image_path, batch, outcome.to_db_string(), faces as i64, now],
        )?;
        Ok(())
    }

    fn is_processed(&self, image_path: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_images WHERE image_path = ?1",
                params![image_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count_processed(&self, batch: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_images WHERE batch_name = ?1",
            params![batch],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch(name: &str) -> Batch {
        Batch::new(name, Some("https://example.com/".into()), PathBuf::from("out").join(name))
    }

    #[test]
    fn test_create_in_memory() {
        assert!(SqliteHistory::new_in_memory().is_ok());
    }

    #[test]
    fn test_record_and_get() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        let mut batch = sample_batch("b1");
        batch.config_hash = Some("abc".into());
        history.record(&batch).unwrap();

        let loaded = history.get("b1").unwrap().unwrap();
        assert_eq!(loaded.name, "b1");
        assert_eq!(loaded.status, BatchStatus::Pending);
        assert_eq!(loaded.source_url.as_deref(), Some("https://example.com/"));
        assert_eq!(loaded.config_hash.as_deref(), Some("abc"));
        assert_eq!(loaded.created_at, batch.created_at);

        assert!(history.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_adds_counters() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        history.record(&sample_batch("b1")).unwrap();

        let delta = StatusDelta::counters(BatchCounters {
            images_downloaded: 3,
            errors: 1,
            ..Default::default()
        });
        history.update("b1", &delta).unwrap();
        history.update("b1", &delta).unwrap();
        history
            .update("b1", &StatusDelta::status(BatchStatus::Downloading))
            .unwrap();

        let loaded = history.get("b1").unwrap().unwrap();
        assert_eq!(loaded.counters.images_downloaded, 6);
        assert_eq!(loaded.counters.errors, 2);
        assert_eq!(loaded.status, BatchStatus::Downloading);
    }

    #[test]
    fn test_update_missing_batch() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        let result = history.update("nope", &StatusDelta::default());
        assert!(matches!(result, Err(StorageError::BatchNotFound(_))));
    }

    #[test]
    fn test_list_and_delete() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        history.record(&sample_batch("a")).unwrap();
        history.record(&sample_batch("b")).unwrap();
        assert_eq!(history.list().unwrap().len(), 2);

        assert!(history.delete("a").unwrap());
        assert!(!history.delete("a").unwrap());

        let remaining = history.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "b");
    }

    #[test]
    fn test_delete_keeps_processed_images() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        history.record(&sample_batch("a")).unwrap();
        history
            .mark_processed("out/a/1.jpg", "a", ProcessedOutcome::Faces, 2)
            .unwrap();

        history.delete("a").unwrap();
        assert!(history.is_processed("out/a/1.jpg").unwrap());
    }

    #[test]
    fn test_processed_images() {
        let mut history = SqliteHistory::new_in_memory().unwrap();
        assert!(!history.is_processed("x.jpg").unwrap());

        history
            .mark_processed("x.jpg", "b1", ProcessedOutcome::NoFace, 0)
            .unwrap();
        history
            .mark_processed("y.jpg", "b1", ProcessedOutcome::Faces, 1)
            .unwrap();

        assert!(history.is_processed("x.jpg").unwrap());
        assert_eq!(history.count_processed("b1").unwrap(), 2);
        assert_eq!(history.count_processed("b2").unwrap(), 0);
    }

    #[test]
    fn test_file_backed_history_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let mut history = SqliteHistory::new(&path).unwrap();
            history.record(&sample_batch("persisted")).unwrap();
        }

        let history = SqliteHistory::new(&path).unwrap();
        assert!(history.get("persisted").unwrap().is_some());
    }
}
