//! Single-writer thread for the face database
//!
//! All appends go through one dedicated OS thread that owns the database.
//! Pipeline workers send entries over a bounded channel and wait for an
//! acknowledgement, so an image is only treated as processed once its entries
//! are on disk.

use crate::ingest::database::{DatabaseError, DatabaseResult, FaceDatabase};
use crate::ingest::extractor::FaceEntry;
use std::thread;
use tokio::sync::{mpsc, oneshot};

/// Pending appends before senders wait
const CHANNEL_CAPACITY: usize = 256;

struct AppendRequest {
    entries: Vec<FaceEntry>,
    ack: oneshot::Sender<DatabaseResult<usize>>,
}

/// Owner of the writer thread
pub struct DatabaseWriter {
    handle: thread::JoinHandle<usize>,
    tx: mpsc::Sender<AppendRequest>,
}

/// Cloneable sending side of the writer
#[derive(Clone)]
pub struct DatabaseHandle {
    tx: mpsc::Sender<AppendRequest>,
}

impl DatabaseWriter {
    /// Moves `database` onto a new writer thread
    pub fn spawn(database: Box<dyn FaceDatabase>) -> Result<Self, DatabaseError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let handle = thread::Builder::new()
            .name("face-db-writer".to_string())
            .spawn(move || Self::writer_loop(database, rx))?;

        Ok(Self { handle, tx })
    }

    /// Returns a new sending handle
    pub fn handle(&self) -> DatabaseHandle {
        DatabaseHandle {
            tx: self.tx.clone(),
        }
    }

    /// Closes the channel and waits for queued appends to finish
    ///
    /// Outstanding [`DatabaseHandle`]s keep the thread alive, so drop them
    /// first.
    ///
    /// # Returns
    ///
    /// The number of entries in the database after the last append
    pub async fn shutdown(self) -> DatabaseResult<usize> {
        let Self { handle, tx } = self;
        drop(tx);

        tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|_| DatabaseError::WriterClosed)?
            .map_err(|_| DatabaseError::WriterClosed)
    }

    fn writer_loop(
        mut database: Box<dyn FaceDatabase>,
        mut rx: mpsc::Receiver<AppendRequest>,
    ) -> usize {
        while let Some(request) = rx.blocking_recv() {
            let count = request.entries.len();
            let result = database.append(&request.entries).map(|()| count);

            if let Err(e) = &result {
                tracing::error!("Face database append failed: {}", e);
            }
            // The requester may have given up on the ack
            let _ = request.ack.send(result);
        }

        tracing::debug!("Face database writer exiting with {} entries", database.len());
        database.len()
    }
}

impl DatabaseHandle {
    /// Appends entries and waits until they are durable
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - Number of entries appended
    /// * `Err(DatabaseError::WriterClosed)` - The writer thread is gone
    /// * `Err(_)` - The append itself failed
    pub async fn append(&self, entries: Vec<FaceEntry>) -> DatabaseResult<usize> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AppendRequest { entries, ack })
            .await
            .map_err(|_| DatabaseError::WriterClosed)?;

        done.await.map_err(|_| DatabaseError::WriterClosed)?
    }
}
