//! Batch lifecycle and counters
//!
//! The `BatchManager` is the only writer of a batch record. Stages report
//! per-item events to it; it advances the counters by deltas (both in memory
//! and in the history ledger), keeps success/failure tallies for the current
//! stage and for the whole run, and decides the terminal status when the run
//! ends.

use crate::batch::progress::{ItemOutcome, ProgressEvent, ProgressReporter};
use crate::state::{Batch, BatchStatus, StatusDelta};
use crate::storage::{lock_history, SharedHistory};
use crate::HarvestError;
use chrono::{Local, Utc};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;

/// Options for creating a batch
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Replace an existing history entry with the same name
    pub overwrite: bool,

    /// Folder holding the batch's images
    pub batch_dir: PathBuf,

    pub config_hash: Option<String>,
}

/// Count of per-item successes and failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTally {
    pub successes: u64,
    pub failures: u64,
}

impl StageTally {
    pub fn is_empty(&self) -> bool {
        self.successes == 0 && self.failures == 0
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success => self.successes += 1,
            ItemOutcome::Failure => self.failures += 1,
            ItemOutcome::Neutral => {}
        }
    }

    /// Terminal status implied by this tally alone
    ///
    /// - No failures: `Completed`
    /// - Failures but no successes: `Failed`
    /// - Both: `PartiallyCompleted`
    pub fn outcome(&self) -> BatchStatus {
        match (self.successes, self.failures) {
            (_, 0) => BatchStatus::Completed,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::PartiallyCompleted,
        }
    }
}

/// Terminal status of a run
///
/// `run` covers every stage; `last` is the tally of the last stage that saw
/// any items. A failure in any stage rules out `Completed`. Otherwise the
/// run is `PartiallyCompleted` if its last stage with items had a success,
/// and `Failed` if it had none.
pub fn run_outcome(run: StageTally, last: StageTally) -> BatchStatus {
    if run.failures == 0 {
        BatchStatus::Completed
    } else if last.successes > 0 {
        BatchStatus::PartiallyCompleted
    } else {
        BatchStatus::Failed
    }
}

#[derive(Debug, Default)]
struct Tallies {
    stage: StageTally,
    last_with_items: StageTally,
    run: StageTally,
}

impl Tallies {
    fn next_stage(&mut self) {
        if !self.stage.is_empty() {
            self.last_with_items = self.stage;
        }
        self.stage = StageTally::default();
    }

    fn outcome(&self) -> BatchStatus {
        let last = if self.stage.is_empty() {
            self.last_with_items
        } else {
            self.stage
        };
        run_outcome(self.run, last)
    }
}

/// Owner of one batch's record
pub struct BatchManager {
    history: SharedHistory,
    batch: Mutex<Batch>,
    tallies: Mutex<Tallies>,
    events: Option<UnboundedSender<ProgressEvent>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BatchManager {
    /// Creates a new pending batch and records it in the history
    ///
    /// # Arguments
    ///
    /// * `history` - The shared history ledger
    /// * `name` - Batch name; generated from the current time when `None`
    /// * `source_url` - Seed URL, if the batch crawls
    /// * `options` - Overwrite policy, folder, and config hash
    /// * `events` - Optional receiver for forwarded progress events
    ///
    /// # Errors
    ///
    /// * `InvalidBatchName` - The name is empty or contains a path separator
    /// * `DuplicateBatchName` - The name exists and `overwrite` is false
    pub fn create(
        history: SharedHistory,
        name: Option<&str>,
        source_url: Option<String>,
        options: CreateOptions,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<Self, HarvestError> {
        let name = match name {
            Some(name) => name.trim().to_string(),
            None => generate_batch_name(),
        };
        validate_batch_name(&name)?;

        let mut batch = Batch::new(name.clone(), source_url, options.batch_dir);
        batch.config_hash = options.config_hash;

        {
            let mut store = lock_history(&history)?;
            if store.get(&name)?.is_some() {
                if !options.overwrite {
                    return Err(HarvestError::DuplicateBatchName(name));
                }
                tracing::warn!("Overwriting existing history entry for batch '{}'", name);
            }
            store.record(&batch)?;
        }

        tracing::info!("Created batch '{}' in {}", name, batch.batch_dir.display());

        Ok(Self {
            history,
            batch: Mutex::new(batch),
            tallies: Mutex::new(Tallies::default()),
            events,
        })
    }

    /// Opens an existing batch from the history
    pub fn open(
        history: SharedHistory,
        name: &str,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<Self, HarvestError> {
        let batch = lock_history(&history)?
            .get(name)?
            .ok_or_else(|| HarvestError::BatchNotFound(name.to_string()))?;

        Ok(Self {
            history,
            batch: Mutex::new(batch),
            tallies: Mutex::new(Tallies::default()),
            events,
        })
    }

    pub fn name(&self) -> String {
        guard(&self.batch).name.clone()
    }

    pub fn status(&self) -> BatchStatus {
        guard(&self.batch).status
    }

    /// Current in-memory copy of the batch
    pub fn snapshot(&self) -> Batch {
        guard(&self.batch).clone()
    }

    /// Success/failure tally of the current stage
    pub fn tally(&self) -> StageTally {
        guard(&self.tallies).stage
    }

    /// Success/failure tally of every stage since the manager was created
    pub fn run_tally(&self) -> StageTally {
        guard(&self.tallies).run
    }

    /// Moves the batch to `next`
    ///
    /// Entering a new stage resets the stage tally.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the state machine does not allow the move.
    pub fn transition(&self, next: BatchStatus) -> Result<(), HarvestError> {
        self.apply_transition(StatusDelta::status(next))
    }

    /// Marks the batch `Failed` after an unrecoverable error
    pub fn fail(&self, error: &HarvestError) -> Result<(), HarvestError> {
        tracing::error!("Batch '{}' failed: {}", self.name(), error);
        self.apply_transition(StatusDelta {
            status: Some(BatchStatus::Failed),
            finished_at: Some(Utc::now()),
            last_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// Ends the run and returns the terminal status
    ///
    /// A cancelled run ends `PartiallyCompleted`. Otherwise the run and
    /// last-stage tallies decide; see [`run_outcome`].
    pub fn finish(&self, cancelled: bool) -> Result<BatchStatus, HarvestError> {
        let status = if cancelled {
            BatchStatus::PartiallyCompleted
        } else {
            guard(&self.tallies).outcome()
        };

        self.apply_transition(StatusDelta {
            status: Some(status),
            finished_at: Some(Utc::now()),
            ..Default::default()
        })?;

        let batch = self.snapshot();
        tracing::info!(
            "Batch '{}' finished as {}: {} found, {} downloaded, {} faces added, {} errors, {} skipped",
            batch.name,
            status,
            batch.counters.images_found,
            batch.counters.images_downloaded,
            batch.counters.faces_added,
            batch.counters.errors,
            batch.counters.skipped
        );
        Ok(status)
    }

    fn apply_transition(&self, delta: StatusDelta) -> Result<(), HarvestError> {
        let Some(next) = delta.status else {
            return Ok(());
        };

        let name = {
            let mut batch = guard(&self.batch);
            if !batch.status.can_transition_to(next) {
                return Err(HarvestError::InvalidTransition {
                    from: batch.status,
                    to: next,
                });
            }
            lock_history(&self.history)?.update(&batch.name, &delta)?;
            batch.apply(&delta);
            batch.name.clone()
        };

        guard(&self.tallies).next_stage();
        tracing::debug!("Batch '{}' is now {}", name, next);
        self.forward(ProgressEvent::StageChanged {
            batch: name,
            status: next,
        });
        Ok(())
    }

    fn forward(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            events.report(event);
        }
    }
}

impl ProgressReporter for BatchManager {
    fn report(&self, event: ProgressEvent) {
        {
            let outcome = event.outcome();
            let mut tallies = guard(&self.tallies);
            tallies.stage.record(outcome);
            tallies.run.record(outcome);
        }

        let counters = event.counter_delta();
        if !counters.is_zero() {
            let mut batch = guard(&self.batch);
            let delta = StatusDelta::counters(counters);
            batch.apply(&delta);

            let persisted = lock_history(&self.history)
                .and_then(|mut store| store.update(&batch.name, &delta));
            if let Err(e) = persisted {
                tracing::warn!("Could not persist counters for '{}': {}", batch.name, e);
            }
        }

        self.forward(event);
    }
}

/// Generates a batch name from the local time
pub fn generate_batch_name() -> String {
    format!("batch_{}", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Checks that a batch name can be used as a folder name
pub fn validate_batch_name(name: &str) -> Result<(), HarvestError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(|c| c.is_control());

    if invalid {
        return Err(HarvestError::InvalidBatchName(name.to_string()));
    }
    Ok(())
}
