//! Face ingestion
//!
//! - `extractor`: the boundary to the external face extractor
//! - `database`: the append-only face database
//! - `writer`: the single thread that owns database appends
//! - `pipeline`: bounded-concurrency processing of a batch folder

mod database;
mod extractor;
mod pipeline;
mod writer;

pub use database::{
    read_entries, verify, DatabaseError, DatabaseResult, DatabaseStats, FaceDatabase,
    JsonLinesDatabase, DATABASE_FILE,
};
pub use extractor::{
    sniff_image, CommandExtractor, DetectionMetadata, ExtractError, FaceEntry, FaceExtractor,
    EXIT_NO_FACE, EXIT_UNREADABLE, THRESHOLD_ENV,
};
pub use pipeline::{
    collect_images, IngestPipeline, ProcessFailure, ProcessOptions, ProcessResult, FACES_DIR,
    NO_FACES_DIR,
};
pub use writer::{DatabaseHandle, DatabaseWriter};
