//! Image-Harvest main entry point
//!
//! This is the command-line interface for the Image-Harvest pipeline.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use image_harvest::batch::ProgressEvent;
use image_harvest::config::{load_config_with_hash, Config};
use image_harvest::harvest::{Harvester, RunOptions};
use image_harvest::ingest::{verify, CommandExtractor, FaceExtractor, DATABASE_FILE};
use image_harvest::output::{
    export_history_markdown, print_batch, print_database_stats, print_history, print_run_report,
};
use image_harvest::state::BatchStatus;
use image_harvest::storage::{lock_history, open_history, SharedHistory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Image-Harvest: a resumable web image ingestion pipeline
///
/// Image-Harvest crawls a site for image URLs, downloads the images into a
/// named batch folder, and optionally runs them through an external face
/// extractor. Every run is recorded in a batch history and can be resumed.
#[derive(Parser, Debug)]
#[command(name = "image-harvest")]
#[command(version)]
#[command(about = "A resumable web image ingestion pipeline", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply if it does not exist)
    #[arg(short, long, global = true, value_name = "FILE", default_value = "image-harvest.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl, download, and optionally process a new batch
    Run(RunArgs),

    /// Re-run face extraction for a batch from the history
    Process {
        /// Batch name
        name: String,

        /// Folder to process instead of the batch folder
        #[arg(long, value_name = "DIR")]
        image_dir: Option<PathBuf>,
    },

    /// Inspect or edit the batch history
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },

    /// Check the face database and print statistics
    Verify,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Start URL for the crawl
    #[arg(long, required_unless_present = "skip_crawl")]
    url: Option<String>,

    /// Maximum pages to fetch in this run
    #[arg(long)]
    max_pages: Option<u64>,

    /// Maximum image URLs to collect and download
    #[arg(long)]
    max_images: Option<usize>,

    /// Downloads released to the worker pool at a time
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batch name (generated from the current time if omitted)
    #[arg(long)]
    batch_name: Option<String>,

    /// Reuse image URLs from the saved crawl state
    #[arg(long)]
    skip_crawl: bool,

    /// Do not download images
    #[arg(long)]
    skip_download: bool,

    /// Run face extraction after downloading
    #[arg(long)]
    process: bool,

    /// Base folder for batch folders
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Discard the saved crawl state before crawling
    #[arg(long, conflicts_with = "skip_crawl")]
    fresh: bool,

    /// Replace an existing history entry with the same name
    #[arg(long)]
    overwrite: bool,

    /// Validate config and show what would run without running it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    /// List all batches, newest first
    List,

    /// Show one batch
    Show { name: String },

    /// Remove a batch from the history (files are kept)
    Delete { name: String },

    /// Export the history as markdown
    Export { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            match &hash {
                Some(hash) => tracing::info!("Configuration loaded successfully (hash: {})", hash),
                None => tracing::info!("No configuration file found, using defaults"),
            }
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e).with_context(|| format!("invalid config {}", cli.config.display()));
        }
    };

    match cli.command {
        Command::Run(args) if args.dry_run => handle_dry_run(&config, &args),
        Command::Run(args) => handle_run(config, config_hash, args).await,
        Command::Process { name, image_dir } => handle_process(config, &name, image_dir).await,
        Command::History { action } => handle_history(&config, action),
        Command::Verify => handle_verify(&config),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("image_harvest=info,warn"),
            1 => EnvFilter::new("image_harvest=debug,info"),
            2 => EnvFilter::new("image_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Cancels `token` on the first Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight work");
            trigger.cancel();
        }
    });
    token
}

/// Logs progress events as they arrive
fn spawn_event_logger(
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::StageChanged { batch, status } => {
                    tracing::info!("Batch '{}': {}", batch, status)
                }
                ProgressEvent::ImagesLoaded { count } => {
                    tracing::info!("{} image URLs queued for download", count)
                }
                other => tracing::trace!("{:?}", other),
            }
        }
    })
}

fn configured_extractor(config: &Config) -> Option<Arc<dyn FaceExtractor>> {
    CommandExtractor::from_config(&config.detection)
        .map(|extractor| Arc::new(extractor) as Arc<dyn FaceExtractor>)
}

fn open_configured_history(config: &Config) -> anyhow::Result<SharedHistory> {
    open_history(&config.paths.history_database).with_context(|| {
        format!(
            "failed to open history database {}",
            config.paths.history_database.display()
        )
    })
}

/// Handles `run --dry-run`: validates config and shows what would run
fn handle_dry_run(config: &Config, args: &RunArgs) -> anyhow::Result<()> {
    println!("=== Image-Harvest Dry Run ===\n");

    println!("Run:");
    match &args.url {
        Some(url) if !args.skip_crawl => println!("  Crawl from: {}", url),
        _ => println!(
            "  Crawl: skipped (image URLs from {})",
            config.paths.state_file.display()
        ),
    }
    println!(
        "  Max pages: {}",
        args.max_pages.map_or("unlimited".to_string(), |n| n.to_string())
    );
    println!(
        "  Max images: {}",
        args.max_images.map_or("unlimited".to_string(), |n| n.to_string())
    );
    println!("  Download: {}", if args.skip_download { "skipped" } else { "yes" });
    println!("  Process: {}", if args.process { "yes" } else { "no" });
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.paths.download_folder.clone());
    println!(
        "  Batch folder: {}",
        output_dir
            .join(args.batch_name.as_deref().unwrap_or("<generated>"))
            .display()
    );

    println!("\nCrawler Configuration:");
    println!("  User agent: {}", config.crawler.user_agent);
    println!("  Request delay: {}ms", config.crawler.request_delay_ms);
    println!("  Max retries: {}", config.crawler.max_retries);
    println!("  Timeout: {}s", config.crawler.timeout_secs);
    println!("  Respect robots.txt: {}", config.crawler.respect_robots);
    println!("  Same domain only: {}", config.crawler.same_domain_only);

    println!("\nDownloader Configuration:");
    println!("  Concurrent downloads: {}", config.downloader.concurrent_downloads);
    println!("  Retry count: {}", config.downloader.retry_count);
    println!("  Timeout: {}s", config.downloader.timeout_secs);
    println!(
        "  Batch size: {}",
        args.batch_size.unwrap_or(config.batch.batch_size)
    );
    println!("  Skip existing: {}", config.batch.skip_existing);

    println!("\nProcessing:");
    match configured_extractor(config) {
        Some(_) => println!(
            "  Extractor: {}",
            config.detection.extractor_command.join(" ")
        ),
        None => println!("  Extractor: not configured"),
    }
    println!("  Detection threshold: {}", config.detection.detection_threshold);
    println!("  Workers: {}", config.batch.processing_workers);
    println!("  Move processed: {}", config.batch.move_processed);

    println!("\nPaths:");
    println!("  Face database: {}", config.paths.database_folder.display());
    println!("  History: {}", config.paths.history_database.display());
    println!("  Crawl state: {}", config.paths.state_file.display());

    println!("\n✓ Configuration is valid");
    if args.process && configured_extractor(config).is_none() {
        println!("✗ --process needs [detection] extractor-command");
    }

    Ok(())
}

/// Handles the main crawl + download + process operation
async fn handle_run(
    config: Config,
    config_hash: Option<String>,
    args: RunArgs,
) -> anyhow::Result<()> {
    let history = open_configured_history(&config)?;
    let extractor = configured_extractor(&config);
    let (tx, rx) = mpsc::unbounded_channel();
    let logger = spawn_event_logger(rx);

    let options = RunOptions {
        start_url: args.url,
        max_pages: args.max_pages,
        max_images: args.max_images,
        batch_size: args.batch_size,
        batch_name: args.batch_name,
        skip_crawl: args.skip_crawl,
        skip_download: args.skip_download,
        auto_process: args.process,
        output_dir: args.output_dir,
        fresh: args.fresh,
        overwrite: args.overwrite,
    };

    if options.fresh {
        tracing::info!("Starting fresh crawl (ignoring previous state)");
    }

    let mut harvester = Harvester::new(config, history)
        .with_events(tx)
        .with_cancellation(cancel_on_interrupt())
        .with_config_hash(config_hash);
    if let Some(extractor) = extractor {
        harvester = harvester.with_extractor(extractor);
    }

    let result = harvester.run(&options).await;
    drop(harvester);
    let _ = logger.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            return Err(e).context("run failed");
        }
    };

    print_run_report(&report);
    if report.batch.status == BatchStatus::Failed {
        bail!("batch '{}' failed", report.batch.name);
    }
    Ok(())
}

/// Handles `process <name>`: re-runs extraction for a recorded batch
async fn handle_process(
    config: Config,
    name: &str,
    image_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let history = open_configured_history(&config)?;
    let Some(extractor) = configured_extractor(&config) else {
        bail!("no extractor configured; set [detection] extractor-command");
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let logger = spawn_event_logger(rx);

    let harvester = Harvester::new(config, history)
        .with_extractor(extractor)
        .with_events(tx)
        .with_cancellation(cancel_on_interrupt());

    let result = harvester.reprocess(name, image_dir.as_deref()).await;
    drop(harvester);
    let _ = logger.await;

    let report = result.with_context(|| format!("processing batch '{}' failed", name))?;
    print_run_report(&report);
    Ok(())
}

/// Handles the `history` subcommands
fn handle_history(config: &Config, action: HistoryCommand) -> anyhow::Result<()> {
    let history = open_configured_history(config)?;
    let mut store = lock_history(&history)?;

    match action {
        HistoryCommand::List => print_history(&store.list()?),
        HistoryCommand::Show { name } => match store.get(&name)? {
            Some(batch) => print_batch(&batch),
            None => bail!("batch '{}' not found", name),
        },
        HistoryCommand::Delete { name } => {
            let Some(batch) = store.get(&name)? else {
                bail!("batch '{}' not found", name);
            };
            store.delete(&name)?;
            println!(
                "✓ Removed '{}' from the history (files in {} were kept)",
                name,
                batch.batch_dir.display()
            );
        }
        HistoryCommand::Export { path } => {
            let batches = store.list()?;
            export_history_markdown(&batches, &path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("✓ History exported to: {}", path.display());
        }
    }

    Ok(())
}

/// Handles `verify`: scans the face database
fn handle_verify(config: &Config) -> anyhow::Result<()> {
    let folder = &config.paths.database_folder;
    let stats = verify(folder)
        .with_context(|| format!("failed to read face database in {}", folder.display()))?;
    print_database_stats(&folder.join(DATABASE_FILE), &stats);

    if stats.corrupt_lines > 0 {
        bail!("face database has {} corrupt line(s)", stats.corrupt_lines);
    }
    Ok(())
}
