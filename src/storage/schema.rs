//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the history ledger.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per batch; counters are advanced in place
CREATE TABLE IF NOT EXISTS batches (
    name TEXT PRIMARY KEY,
    source_url TEXT,
    created_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    images_found INTEGER NOT NULL DEFAULT 0,
    images_downloaded INTEGER NOT NULL DEFAULT 0,
    faces_detected INTEGER NOT NULL DEFAULT 0,
    faces_added INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    batch_dir TEXT NOT NULL,
    config_hash TEXT,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_batches_created ON batches(created_at);

-- Images already handed to the extractor; survives batch deletion
CREATE TABLE IF NOT EXISTS processed_images (
    image_path TEXT PRIMARY KEY,
    batch_name TEXT NOT NULL,
    outcome TEXT NOT NULL,
    faces INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_batch ON processed_images(batch_name);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
