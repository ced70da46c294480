//! Append-only face database
//!
//! Entries are stored as JSON lines in `<database-folder>/faces.jsonl`. Each
//! append is a single write followed by an fsync, so a reader sees either the
//! whole entry or a trailing partial line, which it ignores. A failed append
//! is cut back off the file before the error is returned.

use crate::ingest::extractor::FaceEntry;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the database inside the database folder
pub const DATABASE_FILE: &str = "faces.jsonl";

/// Face database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Database writer has shut down")]
    WriterClosed,
}

pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Append-only store of face entries
pub trait FaceDatabase: Send {
    /// Appends entries; either all of them are durable or an error is returned
    fn append(&mut self, entries: &[FaceEntry]) -> DatabaseResult<()>;

    /// Number of entries stored
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON-lines implementation of [`FaceDatabase`]
pub struct JsonLinesDatabase {
    path: PathBuf,
    file: File,
    entries: usize,
    /// File length after the last successful append
    committed: u64,
}

impl JsonLinesDatabase {
    /// Opens (or creates) the database in `folder`
    ///
    /// A partial line left by a crash mid-append is cut off so the next
    /// append starts on a clean line.
    pub fn open(folder: &Path) -> DatabaseResult<Self> {
        std::fs::create_dir_all(folder)?;
        let path = folder.join(DATABASE_FILE);

        let existing = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let stats = DatabaseStats::from_bytes(&existing);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut committed = existing.len() as u64;
        if stats.torn_tail {
            let keep = existing
                .iter()
                .rposition(|b| *b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            committed = keep as u64;
            tracing::warn!(
                "Truncating partial entry at the end of {} ({} bytes)",
                path.display(),
                existing.len() - keep
            );
            file.set_len(keep as u64)?;
            file.sync_all()?;
        }

        tracing::debug!("Opened face database {} with {} entries", path.display(), stats.entries);

        Ok(Self {
            path,
            file,
            entries: stats.entries,
            committed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FaceDatabase for JsonLinesDatabase {
    fn append(&mut self, entries: &[FaceEntry]) -> DatabaseResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }

        self.committed = append_lines(&mut self.file, self.committed, &buffer)?;
        self.entries += entries.len();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries
    }
}

/// A sink that can be cut back to an earlier length
trait Truncate {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl Truncate for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Writes `buffer` after `committed` bytes and returns the new length
///
/// On any failure the sink is truncated back to `committed`, so a torn
/// write never merges with the next append.
fn append_lines<W: Write + Truncate>(
    sink: &mut W,
    committed: u64,
    buffer: &[u8],
) -> io::Result<u64> {
    let written = sink.write_all(buffer).and_then(|_| sink.sync());
    match written {
        Ok(()) => Ok(committed + buffer.len() as u64),
        Err(e) => {
            if let Err(rollback) = sink.truncate(committed) {
                tracing::error!("Could not roll back failed append: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Result of scanning the database file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Well-formed entries
    pub entries: usize,

    /// Complete lines that do not parse as an entry
    pub corrupt_lines: usize,

    /// The file ends in a partial line
    pub torn_tail: bool,
}

impl DatabaseStats {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut stats = Self::default();
        let (complete, tail) = split_complete(bytes);

        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if serde_json::from_slice::<FaceEntry>(line).is_ok() {
                stats.entries += 1;
            } else {
                stats.corrupt_lines += 1;
            }
        }

        stats.torn_tail = !tail.is_empty();
        stats
    }
}

/// Splits off a trailing line that has no terminating newline
fn split_complete(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(i) => (&bytes[..i], &bytes[i + 1..]),
        None => (&bytes[..0], bytes),
    }
}

/// Reads every well-formed entry, skipping corrupt lines and a partial tail
pub fn read_entries(folder: &Path) -> DatabaseResult<Vec<FaceEntry>> {
    let bytes = match std::fs::read(folder.join(DATABASE_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let (complete, _) = split_complete(&bytes);
    Ok(complete
        .split(|b| *b == b'\n')
        .filter_map(|line| serde_json::from_slice(line).ok())
        .collect())
}

/// Scans the database in `folder` and reports its health
pub fn verify(folder: &Path) -> DatabaseResult<DatabaseStats> {
    match std::fs::read(folder.join(DATABASE_FILE)) {
        Ok(bytes) => Ok(DatabaseStats::from_bytes(&bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DatabaseStats::default()),
        Err(e) => Err(e.into()),
    }
}
