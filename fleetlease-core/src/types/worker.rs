use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, BatchId, ProxyId, WorkerId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Working,
    Error,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Accounts the worker wants per package.
    #[serde(default, alias = "batchSize")]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
}

/// What a working instance currently holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentLease {
    pub batch_id: BatchId,
    pub account_ids: Vec<AccountId>,
    pub proxy_id: ProxyId,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub detail: String,
    #[serde(default)]
    pub severity: Option<ErrorSeverity>,
    pub reported_at: DateTime<Utc>,
}

/// Dashboard view of one connected instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub batch_size: u32,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime_secs: i64,
    pub processed: u64,
    pub success: u64,
    pub failure: u64,
    pub current_lease: Option<CurrentLease>,
    pub recent_errors: Vec<ErrorReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: usize,
    pub idle: usize,
    pub working: usize,
    pub error: usize,
}

impl FleetSummary {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a WorkerStatus>) -> Self {
        let mut summary = FleetSummary::default();
        for status in statuses {
            summary.total += 1;
            match status {
                WorkerStatus::Idle => summary.idle += 1,
                WorkerStatus::Working => summary.working += 1,
                WorkerStatus::Error => summary.error += 1,
            }
        }
        summary
    }
}

/// Immutable record of one completed package.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub worker_id: WorkerId,
    pub batch_size: u32,
    pub processing_ms: i64,
    /// Share of `good` results in the package, `0.0..=1.0`.
    pub success_rate: f64,
    pub avg_response_time_ms: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Worker record as mirrored into the telemetry store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerTelemetry {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub batch_size: u32,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub processed: u64,
    pub success: u64,
    pub failure: u64,
    pub current_batch: Option<BatchId>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to a mirrored worker record. `None` fields keep
/// their stored value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerUpdate {
    pub status: Option<WorkerStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub processed: Option<u64>,
    pub success: Option<u64>,
    pub failure: Option<u64>,
    /// `Some(None)` clears the current batch.
    pub current_batch: Option<Option<BatchId>>,
}

impl WorkerUpdate {
    pub fn apply(&self, record: &mut WorkerTelemetry, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(at) = self.last_heartbeat {
            record.last_heartbeat = at;
        }
        if let Some(processed) = self.processed {
            record.processed = processed;
        }
        if let Some(success) = self.success {
            record.success = success;
        }
        if let Some(failure) = self.failure {
            record.failure = failure;
        }
        if let Some(batch) = &self.current_batch {
            record.current_batch = batch.clone();
        }
        record.updated_at = now;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCounters {
    pub total_checked: u64,
    pub total_success: u64,
    pub total_failure: u64,
}

impl GlobalCounters {
    pub fn success_rate(&self) -> f64 {
        if self.total_checked == 0 {
            return 0.0;
        }
        self.total_success as f64 * 100.0 / self.total_checked as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_only_touches_given_fields() {
        let now = Utc::now();
        let mut record = WorkerTelemetry {
            worker_id: WorkerId::from("w"),
            status: WorkerStatus::Working,
            batch_size: 2,
            connected_at: now,
            last_heartbeat: now,
            processed: 4,
            success: 1,
            failure: 3,
            current_batch: Some(BatchId::from("b")),
            updated_at: now,
        };
        WorkerUpdate {
            status: Some(WorkerStatus::Idle),
            current_batch: Some(None),
            ..WorkerUpdate::default()
        }
        .apply(&mut record, now);
        assert_eq!(record.status, WorkerStatus::Idle);
        assert_eq!(record.current_batch, None);
        assert_eq!(record.processed, 4);
    }

    #[test]
    fn fleet_summary_counts_each_status() {
        let statuses = [WorkerStatus::Idle, WorkerStatus::Working, WorkerStatus::Working];
        let summary = FleetSummary::tally(statuses.iter());
        assert_eq!(summary.total, 3);
        assert_eq!(summary.working, 2);
        assert_eq!(summary.error, 0);
    }
}
