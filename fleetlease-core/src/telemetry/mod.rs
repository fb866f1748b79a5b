//! Liveness and performance bookkeeping. No business rules live here; the
//! coordinator mirrors worker state into the store and dashboards read it.

pub mod memory;
#[cfg(feature = "redis-telemetry")]
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryTelemetryStore;
#[cfg(feature = "redis-telemetry")]
pub use self::redis::RedisTelemetryStore;

use crate::error::Result;
use crate::types::{
    GlobalCounters, PerformanceSample, WorkerId, WorkerTelemetry, WorkerUpdate,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Worker records expire unless refreshed within this window (seconds).
    pub worker_ttl_secs: u64,
    /// Global counters expire after this long without an increment (seconds).
    pub counters_ttl_secs: u64,
    /// Samples kept per buffer.
    pub sample_capacity: usize,
    /// Sample buffers expire after this long without an append (seconds).
    pub sample_ttl_secs: u64,
    /// Samples older than this are dropped by cleanup (days).
    pub retention_days: i64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            worker_ttl_secs: 300,
            counters_ttl_secs: 3_600,
            sample_capacity: 1_000,
            sample_ttl_secs: 86_400,
            retention_days: 7,
        }
    }
}

impl TelemetryConfig {
    pub fn retention(&self) -> chrono::Duration {
        crate::span::days(self.retention_days)
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Writes a fresh worker record and starts its TTL.
    async fn register_worker(&self, record: WorkerTelemetry) -> Result<()>;

    async fn unregister_worker(&self, worker: &WorkerId) -> Result<()>;

    /// Applies a partial update and refreshes the TTL. Missing records are
    /// left missing.
    async fn update_worker(&self, worker: &WorkerId, update: WorkerUpdate) -> Result<()>;

    /// Adds `success` and `failure` checks to the fleet-wide counters.
    async fn increment_global_counters(&self, success: u64, failure: u64) -> Result<()>;

    async fn global_counters(&self) -> Result<GlobalCounters>;

    /// Appends to the worker's buffer and the fleet-wide buffer.
    async fn append_performance_sample(&self, sample: PerformanceSample) -> Result<()>;

    /// Newest first. `None` reads the fleet-wide buffer.
    async fn performance_samples(
        &self,
        worker: Option<&WorkerId>,
        limit: usize,
    ) -> Result<Vec<PerformanceSample>>;

    /// Live (unexpired) worker records.
    async fn list_workers(&self) -> Result<Vec<WorkerTelemetry>>;

    /// Drops samples older than `age`. Returns how many were removed.
    async fn cleanup_older_than(&self, age: chrono::Duration) -> Result<u64>;
}
