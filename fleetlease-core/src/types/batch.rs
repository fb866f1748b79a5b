use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::NewAccount;
use super::ids::BatchId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
        }
    }

    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(BatchStatus::Queued),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

/// Ingestion input: batch metadata plus its items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBatch {
    #[serde(default)]
    pub batch_id: BatchId,
    #[serde(default)]
    pub file_name: String,
    pub accounts: Vec<NewAccount>,
    /// Lines dropped by the upload parser because they repeat within the file.
    #[serde(default)]
    pub duplicates: u32,
    /// Lines the upload parser could not read as credentials.
    #[serde(default)]
    pub rejected: u32,
}

impl NewBatch {
    pub fn new(file_name: impl Into<String>, accounts: Vec<NewAccount>) -> Self {
        Self {
            batch_id: BatchId::new(),
            file_name: file_name.into(),
            accounts,
            duplicates: 0,
            rejected: 0,
        }
    }
}

/// Outcome of ingesting a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: BatchId,
    pub inserted: u32,
    /// Items skipped because their email already exists in the queue.
    pub skipped_existing: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub saved: u32,
    pub good: u32,
    pub bad: u32,
    pub errors: u32,
    pub duplicates: u32,
    pub rejected: u32,
}

impl BatchCounters {
    pub fn outcomes(&self) -> u32 {
        self.good + self.bad + self.errors
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub file_name: String,
    pub account_count: u32,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Fraction of items with a terminal result, in `0.0..=100.0`.
    pub fn progress_percent(&self) -> f64 {
        if self.account_count == 0 {
            return 100.0;
        }
        f64::from(self.counters.saved.min(self.account_count)) * 100.0
            / f64::from(self.account_count)
    }

    /// Share of `good` among terminal results, in `0.0..=100.0`.
    pub fn success_rate(&self) -> f64 {
        let outcomes = self.counters.outcomes();
        if outcomes == 0 {
            return 0.0;
        }
        f64::from(self.counters.good) * 100.0 / f64::from(outcomes)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
}
