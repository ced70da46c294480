//! Markdown export of the batch history
//!
//! This module renders the history ledger as a human-readable report: an
//! overview of all batches followed by one section per batch.

use crate::state::{Batch, BatchStatus};
use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes the history as markdown to `output_path`
///
/// # Arguments
///
/// * `batches` - Batches to include, in display order
/// * `output_path` - Path where the markdown file should be written
///
/// # Returns
///
/// * `Ok(())` - Successfully wrote the report
/// * `Err(io::Error)` - Failed to write the file
pub fn export_history_markdown(batches: &[Batch], output_path: &Path) -> std::io::Result<()> {
    let markdown = format_history_markdown(batches);

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = File::create(output_path)?;
    file.write_all(markdown.as_bytes())?;

    Ok(())
}

/// Formats the history as markdown
///
/// # Arguments
///
/// * `batches` - Batches to include, in display order
///
/// # Returns
///
/// A formatted markdown string
pub fn format_history_markdown(batches: &[Batch]) -> String {
    let mut md = String::new();

    md.push_str("# Image-Harvest Batch History\n\n");
    md.push_str(&format!(
        "Generated {}\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));

    if batches.is_empty() {
        md.push_str("No batches recorded.\n");
        return md;
    }

    // Totals
    let found: u64 = batches.iter().map(|b| b.counters.images_found).sum();
    let downloaded: u64 = batches.iter().map(|b| b.counters.images_downloaded).sum();
    let faces: u64 = batches.iter().map(|b| b.counters.faces_added).sum();
    let errors: u64 = batches.iter().map(|b| b.counters.errors).sum();

    md.push_str("## Overview\n\n");
    md.push_str(&format!("- **Batches**: {}\n", batches.len()));
    md.push_str(&format!("- **Images Found**: {}\n", found));
    md.push_str(&format!("- **Images Downloaded**: {}\n", downloaded));
    md.push_str(&format!("- **Faces Added**: {}\n", faces));
    md.push_str(&format!("- **Errors**: {}\n\n", errors));

    md.push_str("| Status | Batches |\n");
    md.push_str("|--------|---------|\n");
    for status in BatchStatus::all_states() {
        let count = batches.iter().filter(|b| b.status == status).count();
        if count > 0 {
            md.push_str(&format!("| {} | {} |\n", status, count));
        }
    }
    md.push('\n');

    md.push_str("## Batches\n\n");
    md.push_str("| Name | Created | Status | Found | Downloaded | Faces Added | Errors | Skipped |\n");
    md.push_str("|------|---------|--------|-------|------------|-------------|--------|---------|\n");
    for batch in batches {
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
            escape_cell(&batch.name),
            batch.created_at.format("%Y-%m-%d %H:%M"),
            batch.status,
            batch.counters.images_found,
            batch.counters.images_downloaded,
            batch.counters.faces_added,
            batch.counters.errors,
            batch.counters.skipped
        ));
    }
    md.push('\n');

    // Per-batch details
    for batch in batches {
        md.push_str(&format!("### {}\n\n", batch.name));
        if let Some(source) = &batch.source_url {
            md.push_str(&format!("- **Source**: {}\n", source));
        }
        md.push_str(&format!("- **Folder**: `{}`\n", batch.batch_dir.display()));
        md.push_str(&format!("- **Created**: {}\n", batch.created_at.to_rfc3339()));
        if let Some(finished) = batch.finished_at {
            md.push_str(&format!("- **Finished**: {}\n", finished.to_rfc3339()));
            let minutes = (finished - batch.created_at).num_seconds() as f64 / 60.0;
            md.push_str(&format!("- **Duration**: {:.2} minutes\n", minutes));
        }
        md.push_str(&format!(
            "- **Faces Detected / Added**: {} / {}\n",
            batch.counters.faces_detected, batch.counters.faces_added
        ));
        if let Some(hash) = &batch.config_hash {
            md.push_str(&format!("- **Config Hash**: {}\n", hash));
        }
        if let Some(error) = &batch.last_error {
            md.push_str(&format!("- **Last Error**: {}\n", error));
        }
        md.push('\n');
    }

    md
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}
