//! Output module for run reports and history exports
//!
//! This module handles:
//! - Printing run, batch, and history reports to the console
//! - Exporting the history ledger as markdown
//! - Printing face database statistics

mod markdown;
mod report;

pub use markdown::{export_history_markdown, format_history_markdown};
pub use report::{print_batch, print_database_stats, print_history, print_run_report};
