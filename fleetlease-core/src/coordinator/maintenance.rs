use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::telemetry::TelemetryConfig;

/// Periodic housekeeping: liveness sweep, telemetry sample cleanup and
/// completed-account retention. Runs until `cancel` fires.
pub async fn run(
    coordinator: Arc<Coordinator>,
    telemetry: TelemetryConfig,
    cancel: CancellationToken,
) {
    let config = *coordinator.config();
    let mut sweep = ticker(config.sweep_interval_secs);
    let mut telemetry_cleanup = ticker(config.telemetry_cleanup_interval_secs);
    let mut retention = ticker(config.retention_interval_secs);

    info!(
        sweep_secs = config.sweep_interval_secs,
        retention_days = coordinator.leases().config().retention_days,
        "maintenance loop started"
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = coordinator.sweep_stale().await;
                debug!(evicted, "liveness sweep");
            }
            _ = telemetry_cleanup.tick() => {
                match coordinator.telemetry().cleanup_older_than(telemetry.retention()).await {
                    Ok(removed) => debug!(removed, "telemetry samples pruned"),
                    Err(err) => warn!(error = %err, "telemetry cleanup failed"),
                }
            }
            _ = retention.tick() => {
                match coordinator.leases().cleanup_retention().await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "expired completed accounts"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "account retention failed"),
                }
            }
        }
    }
    info!("maintenance loop stopped");
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    // The first tick of a tokio interval fires at once; skip it.
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
