/// Batch lifecycle states
///
/// The normal path is `Pending -> Crawling -> Downloading -> Processing` and then
/// one of the three terminal outcomes. Stages can be skipped forward but never
/// revisited, and any non-terminal stage may fail directly.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current lifecycle state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    // ===== Active States =====
    /// Batch has been created but no stage has started
    Pending,

    /// Pages are being crawled for image URLs
    Crawling,

    /// Image URLs are being downloaded
    Downloading,

    /// Downloaded images are being handed to the face extractor
    Processing,

    // ===== Terminal States =====
    /// Every item succeeded
    Completed,

    /// At least one success and at least one failure, or the run was cancelled
    PartiallyCompleted,

    /// No item succeeded, or an environment failure aborted the batch
    Failed,
}

impl BatchStatus {
    /// Returns true if no further stage will run for this batch
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed
        )
    }

    /// Position in the pipeline; terminal states share the last rank
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Crawling => 1,
            Self::Downloading => 2,
            Self::Processing => 3,
            Self::Completed | Self::PartiallyCompleted | Self::Failed => 4,
        }
    }

    /// Returns true if the batch may move from `self` to `next`
    ///
    /// - Active states move forward only, skipping stages as needed.
    /// - Any active state may go straight to `Failed`.
    /// - A terminal batch may only be reopened into `Processing`.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if self.is_terminal() {
            return next == Self::Processing;
        }
        next.rank() > self.rank()
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Crawling => "crawling",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from a database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "crawling" => Some(Self::Crawling),
            "downloading" => Some(Self::Downloading),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "partially_completed" => Some(Self::PartiallyCompleted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all possible batch states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Crawling,
            Self::Downloading,
            Self::Processing,
            Self::Completed,
            Self::PartiallyCompleted,
            Self::Failed,
        ]
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Crawling => "Crawling",
            Self::Downloading => "Downloading",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::PartiallyCompleted => "Partially Completed",
            Self::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}
