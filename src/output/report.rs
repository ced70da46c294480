//! Console reports for the command-line interface

use crate::harvest::RunReport;
use crate::ingest::DatabaseStats;
use crate::state::Batch;
use std::path::Path;

/// Prints the outcome of a run or a reprocess
///
/// # Arguments
///
/// * `report` - The report returned by the harvester
pub fn print_run_report(report: &RunReport) {
    println!("=== Batch '{}' ===\n", report.batch.name);
    println!("Status: {}", report.batch.status);
    if report.cancelled {
        println!("(cancelled before all stages finished)");
    }
    println!("Folder: {}", report.batch.batch_dir.display());
    println!();

    if let Some(crawl) = &report.crawl {
        println!("Crawl:");
        println!("  Pages visited: {}", crawl.pages_visited);
        println!("  Pages failed: {}", crawl.pages_failed);
        println!("  Pages skipped (robots.txt): {}", crawl.pages_skipped);
        println!(
            "  Image URLs: {} new, {} total",
            crawl.new_images, crawl.total_images
        );
        println!("  Frontier remaining: {}", crawl.frontier_remaining);
        println!("  Stopped: {:?}", crawl.stop_reason);
        println!();
    }

    if let Some(download) = &report.download {
        println!("Download:");
        println!(
            "  Enqueued: {} (of {} requested)",
            download.enqueued, download.requested
        );
        println!("  Succeeded: {}", download.succeeded);
        println!("  Skipped: {}", download.skipped);
        println!("  Failed: {}", download.failed);
        for failure in download.failures.iter().take(10) {
            println!("    - {}: {}", failure.url, failure.reason);
        }
        if download.failures.len() > 10 {
            println!("    ... and {} more", download.failures.len() - 10);
        }
        println!("  Elapsed: {:.1}s", download.elapsed.as_secs_f64());
        println!();
    }

    if let Some(process) = &report.process {
        println!("Processing:");
        println!("  Images: {}", process.images_found);
        println!(
            "  With faces: {} ({} detected, {} added)",
            process.processed, process.faces_detected, process.faces_added
        );
        println!("  No face: {}", process.no_face);
        println!("  Already processed: {}", process.already_processed);
        println!("  Failed: {}", process.failed);
        for failure in process.failures.iter().take(10) {
            println!("    - {}: {}", failure.path.display(), failure.reason);
        }
        if process.not_started > 0 {
            println!("  Not started: {}", process.not_started);
        }
        println!();
    }

    print_counters(&report.batch);
}

/// Prints one batch from the history
pub fn print_batch(batch: &Batch) {
    println!("=== Batch '{}' ===\n", batch.name);
    println!("Status: {}", batch.status);
    if let Some(source) = &batch.source_url {
        println!("Source: {}", source);
    }
    println!("Folder: {}", batch.batch_dir.display());
    println!("Created: {}", batch.created_at.to_rfc3339());
    if let Some(finished) = batch.finished_at {
        println!("Finished: {}", finished.to_rfc3339());
    }
    if let Some(hash) = &batch.config_hash {
        println!("Config hash: {}", hash);
    }
    if let Some(error) = &batch.last_error {
        println!("Last error: {}", error);
    }
    println!();
    print_counters(batch);
}

fn print_counters(batch: &Batch) {
    let counters = &batch.counters;
    println!("Counters:");
    println!("  Images found: {}", counters.images_found);
    println!("  Images downloaded: {}", counters.images_downloaded);
    println!("  Faces detected: {}", counters.faces_detected);
    println!("  Faces added: {}", counters.faces_added);
    println!("  Errors: {}", counters.errors);
    println!("  Skipped: {}", counters.skipped);
}

/// Prints the history as a table, newest first
pub fn print_history(batches: &[Batch]) {
    if batches.is_empty() {
        println!("No batches recorded.");
        return;
    }

    println!(
        "{:<28} {:<20} {:<20} {:>7} {:>10} {:>7} {:>7}",
        "NAME", "CREATED", "STATUS", "FOUND", "DOWNLOADED", "FACES", "ERRORS"
    );
    for batch in batches {
        println!(
            "{:<28} {:<20} {:<20} {:>7} {:>10} {:>7} {:>7}",
            batch.name,
            batch.created_at.format("%Y-%m-%d %H:%M:%S"),
            batch.status.to_string(),
            batch.counters.images_found,
            batch.counters.images_downloaded,
            batch.counters.faces_added,
            batch.counters.errors
        );
    }
    println!("\n{} batch(es)", batches.len());
}

/// Prints face database statistics
pub fn print_database_stats(path: &Path, stats: &DatabaseStats) {
    println!("=== Face Database ===\n");
    println!("File: {}", path.display());
    println!("Entries: {}", stats.entries);
    println!("Corrupt lines: {}", stats.corrupt_lines);
    if stats.torn_tail {
        println!("Trailing partial entry: yes (ignored; removed on next append)");
    }

    if stats.corrupt_lines == 0 {
        println!("\n✓ Database is consistent");
    } else {
        println!("\n✗ Database has {} unreadable line(s)", stats.corrupt_lines);
    }
}
