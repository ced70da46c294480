//! State module for tracking harvest progress
//!
//! # Components
//!
//! - `CrawlState`: Resumable frontier, visited set, and discovered image URLs
//! - `BatchStatus`: Lifecycle state machine for a batch
//! - `Batch`: A named run with its counters, as stored in the history ledger

mod batch;
mod batch_status;
mod crawl_state;

// Re-export main types
pub use batch::{Batch, BatchCounters, StatusDelta};
pub use batch_status::BatchStatus;
pub use crawl_state::{CrawlState, FailedPage};
