use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coordinator tuning. Timings are in the units their names carry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// A registered worker silent for longer than this is evicted.
    pub heartbeat_timeout_secs: u64,
    /// Heartbeat cadence advertised to workers at registration.
    pub heartbeat_interval_ms: u64,
    /// Liveness sweep cadence.
    pub sweep_interval_secs: u64,
    /// Delay between a successful registration and the first assignment.
    pub initial_assignment_delay_ms: u64,
    /// Delay between acknowledging results and the next assignment.
    pub resubmit_cooldown_ms: u64,
    pub no_work_retry_ms: u64,
    pub no_proxy_retry_ms: u64,
    /// Package size for workers that do not announce one.
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    /// Error reports kept per worker.
    pub error_buffer_size: usize,
    /// Error reports included in a dashboard snapshot.
    pub snapshot_error_count: usize,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    pub telemetry_cleanup_interval_secs: u64,
    pub retention_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 180,
            heartbeat_interval_ms: 30_000,
            sweep_interval_secs: 60,
            initial_assignment_delay_ms: 1_000,
            resubmit_cooldown_ms: 2_000,
            no_work_retry_ms: 30_000,
            no_proxy_retry_ms: 60_000,
            default_batch_size: 2,
            max_batch_size: 50,
            error_buffer_size: 50,
            snapshot_error_count: 5,
            outbound_buffer: 64,
            telemetry_cleanup_interval_secs: 3_600,
            retention_interval_secs: 86_400,
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        crate::span::secs(self.heartbeat_timeout_secs)
    }

    pub fn initial_assignment_delay(&self) -> Duration {
        Duration::from_millis(self.initial_assignment_delay_ms)
    }

    pub fn resubmit_cooldown(&self) -> Duration {
        Duration::from_millis(self.resubmit_cooldown_ms)
    }

    /// Clamps a worker-announced package size.
    pub fn batch_size_for(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_batch_size)
            .clamp(1, self.max_batch_size.max(1))
    }
}
