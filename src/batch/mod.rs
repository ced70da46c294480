//! Batch management
//!
//! A batch is one named crawl + download + process run. This module owns its
//! lifecycle, its counters, and the progress events that advance them.

mod manager;
mod progress;

pub use manager::{
    generate_batch_name, run_outcome, validate_batch_name, BatchManager, CreateOptions,
    StageTally,
};
pub use progress::{ItemOutcome, NoopReporter, ProgressEvent, ProgressReporter};
