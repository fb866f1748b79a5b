use anyhow::Result;
use chrono::Utc;
use fleetlease_core::telemetry::{InMemoryTelemetryStore, TelemetryConfig, TelemetryStore};
use fleetlease_core::types::{
    BatchId, PerformanceSample, WorkerId, WorkerStatus, WorkerTelemetry, WorkerUpdate,
};

fn record(worker: &str) -> WorkerTelemetry {
    let now = Utc::now();
    WorkerTelemetry {
        worker_id: WorkerId::from(worker),
        status: WorkerStatus::Idle,
        batch_size: 2,
        connected_at: now,
        last_heartbeat: now,
        processed: 0,
        success: 0,
        failure: 0,
        current_batch: None,
        updated_at: now,
    }
}

fn sample(worker: &str, success_rate: f64) -> PerformanceSample {
    PerformanceSample {
        worker_id: WorkerId::from(worker),
        batch_size: 2,
        processing_ms: 4_000,
        success_rate,
        avg_response_time_ms: Some(250.0),
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn worker_records_follow_updates() -> Result<()> {
    let store = InMemoryTelemetryStore::default();
    store.register_worker(record("b")).await?;
    store.register_worker(record("a")).await?;

    store
        .update_worker(
            &WorkerId::from("a"),
            WorkerUpdate {
                status: Some(WorkerStatus::Working),
                current_batch: Some(Some(BatchId::from("batch-1"))),
                ..WorkerUpdate::default()
            },
        )
        .await?;
    // Updates never resurrect unknown workers.
    store
        .update_worker(&WorkerId::from("ghost"), WorkerUpdate::default())
        .await?;

    let workers = store.list_workers().await?;
    let ids: Vec<&str> = workers.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(workers[0].status, WorkerStatus::Working);
    assert_eq!(workers[0].current_batch, Some(BatchId::from("batch-1")));

    store
        .update_worker(
            &WorkerId::from("a"),
            WorkerUpdate {
                current_batch: Some(None),
                processed: Some(4),
                ..WorkerUpdate::default()
            },
        )
        .await?;
    let workers = store.list_workers().await?;
    assert_eq!(workers[0].current_batch, None);
    assert_eq!(workers[0].processed, 4);

    store.unregister_worker(&WorkerId::from("a")).await?;
    assert_eq!(store.list_workers().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn worker_records_expire_without_refresh() -> Result<()> {
    let store = InMemoryTelemetryStore::new(TelemetryConfig {
        worker_ttl_secs: 0,
        ..TelemetryConfig::default()
    });
    store.register_worker(record("w")).await?;
    assert!(store.list_workers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn global_counters_accumulate() -> Result<()> {
    let store = InMemoryTelemetryStore::default();
    store.increment_global_counters(3, 1).await?;
    store.increment_global_counters(1, 0).await?;
    let counters = store.global_counters().await?;
    assert_eq!(counters.total_checked, 5);
    assert_eq!(counters.total_success, 4);
    assert_eq!(counters.total_failure, 1);
    assert_eq!(counters.success_rate(), 80.0);
    Ok(())
}

#[tokio::test]
async fn samples_are_newest_first_per_worker_and_fleet() -> Result<()> {
    let store = InMemoryTelemetryStore::default();
    store.append_performance_sample(sample("w1", 0.1)).await?;
    store.append_performance_sample(sample("w2", 0.2)).await?;
    store.append_performance_sample(sample("w1", 0.3)).await?;

    let own = store
        .performance_samples(Some(&WorkerId::from("w1")), 10)
        .await?;
    let rates: Vec<f64> = own.iter().map(|s| s.success_rate).collect();
    assert_eq!(rates, vec![0.3, 0.1]);

    let fleet = store.performance_samples(None, 2).await?;
    let rates: Vec<f64> = fleet.iter().map(|s| s.success_rate).collect();
    assert_eq!(rates, vec![0.3, 0.2]);
    Ok(())
}
