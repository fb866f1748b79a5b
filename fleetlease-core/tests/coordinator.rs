use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_core::coordinator::{
    ClientMessage, ControlAction, Coordinator, CoordinatorConfig, CoordinatorDeps,
    ErrorKind, ServerMessage, WorkerConnection,
};
use fleetlease_core::error::CoreError;
use fleetlease_core::leasing::{
    AccountRepository, InMemoryAccountRepository, LeaseConfig, LeaseManager, ReleaseScope,
};
use fleetlease_core::proxy_pool::{InMemoryProxyRepository, ProxyPool};
use fleetlease_core::telemetry::{InMemoryTelemetryStore, TelemetryStore};
use fleetlease_core::types::{
    AccountId, AccountLease, AccountRecord, AccountStats, AccountStatus, BatchCreated,
    BatchId, BatchRecord, BatchStats, ClassifiedResult, NewAccount, NewBatch,
    ProxyCandidate, ProxyStatusReport, ResultReport, SubmitSummary, WorkerCapabilities,
    WorkerId, WorkerStatus,
};
use tokio::sync::mpsc;

struct Harness {
    coordinator: Arc<Coordinator>,
    leases: LeaseManager,
    proxies: Arc<ProxyPool>,
    proxy_repo: InMemoryProxyRepository,
    telemetry: Arc<InMemoryTelemetryStore>,
}

/// Assignments are only ever triggered explicitly unless a test opts in.
fn quiet_config() -> CoordinatorConfig {
    CoordinatorConfig {
        initial_assignment_delay_ms: 3_600_000,
        resubmit_cooldown_ms: 3_600_000,
        ..CoordinatorConfig::default()
    }
}

fn harness(config: CoordinatorConfig) -> Harness {
    harness_with(config, Arc::new(InMemoryAccountRepository::new()))
}

fn harness_with(config: CoordinatorConfig, accounts: Arc<dyn AccountRepository>) -> Harness {
    let leases = LeaseManager::new(accounts, LeaseConfig::default());
    let proxy_repo = InMemoryProxyRepository::new();
    let proxies = Arc::new(ProxyPool::new(Arc::new(proxy_repo.clone())));
    let telemetry = Arc::new(InMemoryTelemetryStore::default());
    let coordinator = Coordinator::new(
        CoordinatorDeps {
            leases: leases.clone(),
            proxies: proxies.clone(),
            telemetry: telemetry.clone(),
        },
        config,
    );
    Harness {
        coordinator,
        leases,
        proxies,
        proxy_repo,
        telemetry,
    }
}

impl Harness {
    async fn seed(&self, accounts: usize, proxies: u16) -> Result<()> {
        if accounts > 0 {
            let input = (0..accounts)
                .map(|i| NewAccount::new(format!("user{i}@example.com"), "pw"))
                .collect();
            self.leases.create_batch(NewBatch::new("seed.txt", input)).await?;
        }
        if proxies > 0 {
            let candidates = (0..proxies)
                .map(|i| ProxyCandidate::new(format!("10.1.0.{i}"), 3128))
                .collect();
            self.proxies.replace_all(candidates, "seed").await?;
        }
        Ok(())
    }

    async fn register(
        &self,
        worker: &str,
        batch_size: u32,
    ) -> Result<(Arc<WorkerConnection>, mpsc::Receiver<ServerMessage>)> {
        let (connection, mut rx) = self.coordinator.connect();
        self.coordinator
            .handle_message(
                &connection,
                ClientMessage::Register {
                    worker_id: Some(worker.to_string()),
                    capabilities: WorkerCapabilities {
                        batch_size: Some(batch_size),
                        version: None,
                    },
                },
            )
            .await;
        match next(&mut rx).await? {
            ServerMessage::Registered { .. } => Ok((connection, rx)),
            other => bail!("expected registered, got {other:?}"),
        }
    }
}

/// In-memory accounts whose result writes can be switched to fail.
#[derive(Debug, Default)]
struct FailingSubmissions {
    inner: InMemoryAccountRepository,
    fail: AtomicBool,
}

#[async_trait]
impl AccountRepository for FailingSubmissions {
    async fn create_batch(&self, batch: NewBatch) -> fleetlease_core::Result<BatchCreated> {
        self.inner.create_batch(batch).await
    }

    async fn checkout(
        &self,
        worker: &WorkerId,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> fleetlease_core::Result<Vec<AccountLease>> {
        self.inner.checkout(worker, limit, stale_before).await
    }

    async fn apply_results(
        &self,
        worker: &WorkerId,
        results: Vec<ClassifiedResult>,
    ) -> fleetlease_core::Result<SubmitSummary> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Database("down".into()));
        }
        self.inner.apply_results(worker, results).await
    }

    async fn release(&self, scope: ReleaseScope) -> fleetlease_core::Result<u64> {
        self.inner.release(scope).await
    }

    async fn account(&self, id: AccountId) -> fleetlease_core::Result<Option<AccountRecord>> {
        self.inner.account(id).await
    }

    async fn batch(&self, id: &BatchId) -> fleetlease_core::Result<Option<BatchRecord>> {
        self.inner.batch(id).await
    }

    async fn list_batches(&self, limit: u32) -> fleetlease_core::Result<Vec<BatchRecord>> {
        self.inner.list_batches(limit).await
    }

    async fn account_stats(&self) -> fleetlease_core::Result<AccountStats> {
        self.inner.account_stats().await
    }

    async fn batch_stats(&self) -> fleetlease_core::Result<BatchStats> {
        self.inner.batch_stats().await
    }

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> fleetlease_core::Result<u64> {
        self.inner.delete_completed_before(cutoff).await
    }
}

async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> Result<ServerMessage> {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await? {
        Some(message) => Ok(message),
        None => bail!("outbound channel closed"),
    }
}

async fn request_work(
    coordinator: &Arc<Coordinator>,
    connection: &Arc<WorkerConnection>,
    rx: &mut mpsc::Receiver<ServerMessage>,
) -> Result<ServerMessage> {
    coordinator
        .handle_message(connection, ClientMessage::RequestWork)
        .await;
    next(rx).await
}

fn assigned(message: ServerMessage) -> Result<Vec<AccountLease>> {
    match message {
        ServerMessage::WorkAssigned { accounts, .. } => Ok(accounts),
        other => bail!("expected work_assigned, got {other:?}"),
    }
}

#[tokio::test]
async fn registration_requires_a_worker_id() -> Result<()> {
    let h = harness(quiet_config());
    let (connection, mut rx) = h.coordinator.connect();

    h.coordinator
        .handle_message(
            &connection,
            ClientMessage::Register {
                worker_id: Some("   ".into()),
                capabilities: WorkerCapabilities::default(),
            },
        )
        .await;
    assert!(matches!(next(&mut rx).await?, ServerMessage::RegistrationError { .. }));
    assert!(!connection.is_closed());

    let reply = request_work(&h.coordinator, &connection, &mut rx).await?;
    assert!(matches!(
        reply,
        ServerMessage::Error {
            kind: ErrorKind::NotRegistered,
            ..
        }
    ));

    h.coordinator
        .handle_message(
            &connection,
            ClientMessage::Register {
                worker_id: Some("w1".into()),
                capabilities: WorkerCapabilities {
                    batch_size: Some(500),
                    version: Some("1.2.0".into()),
                },
            },
        )
        .await;
    match next(&mut rx).await? {
        ServerMessage::Registered {
            worker_id,
            batch_size,
            heartbeat_interval_ms,
        } => {
            assert_eq!(worker_id, WorkerId::from("w1"));
            assert_eq!(batch_size, 50);
            assert_eq!(heartbeat_interval_ms, 30_000);
        }
        other => bail!("unexpected {other:?}"),
    }
    let workers = h.telemetry.list_workers().await?;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn registration_triggers_first_assignment() -> Result<()> {
    let h = harness(CoordinatorConfig {
        initial_assignment_delay_ms: 10,
        ..quiet_config()
    });
    h.seed(3, 1).await?;
    let (_connection, mut rx) = h.register("w1", 2).await?;

    let accounts = assigned(next(&mut rx).await?)?;
    assert_eq!(accounts.len(), 2);
    assert!(h.proxy_repo.is_empty());

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot[0].status, WorkerStatus::Working);
    let lease = snapshot[0].current_lease.as_ref().expect("lease recorded");
    assert_eq!(lease.account_ids.len(), 2);
    Ok(())
}

#[tokio::test]
async fn backpressure_signals_carry_retry_hints() -> Result<()> {
    let h = harness(quiet_config());
    let (connection, mut rx) = h.register("w1", 2).await?;

    let reply = request_work(&h.coordinator, &connection, &mut rx).await?;
    assert_eq!(
        reply,
        ServerMessage::NoWorkAvailable {
            retry_after_ms: 30_000
        }
    );

    h.seed(2, 0).await?;
    let reply = request_work(&h.coordinator, &connection, &mut rx).await?;
    assert_eq!(
        reply,
        ServerMessage::NoProxyAvailable {
            retry_after_ms: 60_000
        }
    );
    // The accounts checked out for the failed assignment went back.
    let stats = h.leases.account_stats().await?;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 0);
    assert_eq!(h.coordinator.summary().idle, 1);
    Ok(())
}

#[tokio::test]
async fn working_worker_is_not_assigned_twice() -> Result<()> {
    let h = harness(quiet_config());
    h.seed(4, 2).await?;
    let (connection, mut rx) = h.register("w1", 2).await?;

    assigned(request_work(&h.coordinator, &connection, &mut rx).await?)?;
    h.coordinator
        .handle_message(&connection, ClientMessage::RequestWork)
        .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "second request while working must be ignored"
    );
    assert_eq!(h.proxy_repo.len(), 1);
    Ok(())
}

#[tokio::test]
async fn submission_records_results_and_releases_leftovers() -> Result<()> {
    let h = harness(quiet_config());
    h.seed(3, 1).await?;
    let (connection, mut rx) = h.register("w1", 3).await?;
    let accounts = assigned(request_work(&h.coordinator, &connection, &mut rx).await?)?;

    h.coordinator
        .handle_message(
            &connection,
            ClientMessage::SubmitResults {
                results: vec![
                    ResultReport {
                        response_time_ms: Some(120),
                        ..ResultReport::for_account(accounts[0].id, "good")
                    },
                    ResultReport::for_account(accounts[1].id, "mobile_2step"),
                ],
                resource_report: Some(ProxyStatusReport {
                    proxy_id: None,
                    success: true,
                    response_time_ms: Some(80),
                    error: None,
                }),
                batch_info: None,
            },
        )
        .await;
    assert_eq!(
        next(&mut rx).await?,
        ServerMessage::ResultsAcknowledged { processed_count: 2 }
    );

    let third = h.leases.account(accounts[2].id).await?.expect("account exists");
    assert_eq!(third.status, AccountStatus::Pending);
    let stats = h.leases.account_stats().await?;
    assert_eq!(stats.completed, 2);

    let counters = h.telemetry.global_counters().await?;
    assert_eq!(counters.total_checked, 2);
    assert_eq!(counters.total_success, 1);
    assert_eq!(h.proxies.stats().await?.reported_success, 1);

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot[0].status, WorkerStatus::Idle);
    assert_eq!((snapshot[0].processed, snapshot[0].success, snapshot[0].failure), (2, 1, 1));

    let samples = h
        .telemetry
        .performance_samples(Some(&WorkerId::from("w1")), 10)
        .await?;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].success_rate, 0.5);
    assert_eq!(samples[0].avg_response_time_ms, Some(120.0));
    Ok(())
}

#[tokio::test]
async fn next_assignment_follows_the_cooldown() -> Result<()> {
    let h = harness(CoordinatorConfig {
        resubmit_cooldown_ms: 10,
        ..quiet_config()
    });
    h.seed(4, 2).await?;
    let (connection, mut rx) = h.register("w1", 2).await?;
    let accounts = assigned(request_work(&h.coordinator, &connection, &mut rx).await?)?;

    let results = accounts
        .iter()
        .map(|a| ResultReport::for_account(a.id, "bad"))
        .collect();
    h.coordinator
        .handle_message(
            &connection,
            ClientMessage::SubmitResults {
                results,
                resource_report: None,
                batch_info: None,
            },
        )
        .await;
    assert!(matches!(next(&mut rx).await?, ServerMessage::ResultsAcknowledged { .. }));
    let follow_up = assigned(next(&mut rx).await?)?;
    assert_eq!(follow_up.len(), 2);
    Ok(())
}

#[tokio::test]
async fn disconnect_reclaims_leases_and_telemetry() -> Result<()> {
    let h = harness(quiet_config());
    h.seed(3, 2).await?;
    let (w1, mut rx1) = h.register("w1", 3).await?;
    let leased = assigned(request_work(&h.coordinator, &w1, &mut rx1).await?)?;

    h.coordinator.disconnect(w1.id, "socket closed").await;
    h.coordinator.disconnect(w1.id, "socket closed").await;
    assert!(w1.is_closed());
    assert!(h.telemetry.list_workers().await?.is_empty());
    assert_eq!(h.leases.account_stats().await?.pending, 3);

    let (w3, mut rx3) = h.register("w3", 3).await?;
    let reassigned = assigned(request_work(&h.coordinator, &w3, &mut rx3).await?)?;
    let before: Vec<_> = leased.iter().map(|a| a.id).collect();
    let after: Vec<_> = reassigned.iter().map(|a| a.id).collect();
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_evicts_the_older_connection() -> Result<()> {
    let h = harness(quiet_config());
    h.seed(2, 2).await?;
    let (old, mut old_rx) = h.register("w1", 2).await?;
    assigned(request_work(&h.coordinator, &old, &mut old_rx).await?)?;

    let (new, _new_rx) = h.register("w1", 2).await?;
    assert!(old.is_closed());
    assert!(!new.is_closed());
    assert_eq!(h.coordinator.connection_count(), 1);
    assert_eq!(h.leases.account_stats().await?.pending, 2);

    let workers = h.telemetry.list_workers().await?;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, WorkerId::from("w1"));
    Ok(())
}

#[tokio::test]
async fn sweep_evicts_silent_workers() -> Result<()> {
    let h = harness(quiet_config());
    h.seed(2, 1).await?;
    let (silent, mut silent_rx) = h.register("silent", 2).await?;
    let (chatty, mut chatty_rx) = h.register("chatty", 2).await?;
    assigned(request_work(&h.coordinator, &silent, &mut silent_rx).await?)?;

    silent.with_instance(|i| i.last_heartbeat = Utc::now() - chrono::Duration::minutes(4));
    h.coordinator
        .handle_message(
            &chatty,
            ClientMessage::Heartbeat {
                status: Some("idle".into()),
                current_batch: None,
            },
        )
        .await;
    assert!(matches!(next(&mut chatty_rx).await?, ServerMessage::HeartbeatAck { .. }));

    assert_eq!(h.coordinator.sweep_stale().await, 1);
    assert!(silent.is_closed());
    assert!(!chatty.is_closed());
    assert_eq!(h.leases.account_stats().await?.pending, 2);
    Ok(())
}

#[tokio::test]
async fn error_reports_are_buffered_without_reply() -> Result<()> {
    let h = harness(quiet_config());
    let (connection, mut rx) = h.register("w1", 2).await?;
    h.coordinator
        .handle_message(
            &connection,
            ClientMessage::ErrorReport {
                detail: "browser crashed".into(),
                severity: None,
            },
        )
        .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot[0].status, WorkerStatus::Error);
    assert_eq!(snapshot[0].recent_errors[0].detail, "browser crashed");
    assert_eq!(h.coordinator.summary().error, 1);
    Ok(())
}

#[tokio::test]
async fn control_commands_reach_targets() -> Result<()> {
    let h = harness(quiet_config());
    let (a, mut rx_a) = h.register("a", 2).await?;
    let (_b, mut rx_b) = h.register("b", 2).await?;

    let sent = h.coordinator.send_control(None, ControlAction::Pause).await;
    assert_eq!(sent, 2);
    assert_eq!(next(&mut rx_a).await?, ServerMessage::Control { action: ControlAction::Pause });
    assert_eq!(next(&mut rx_b).await?, ServerMessage::Control { action: ControlAction::Pause });

    let sent = h
        .coordinator
        .send_control(Some(&WorkerId::from("a")), ControlAction::Disconnect)
        .await;
    assert_eq!(sent, 1);
    assert!(a.is_closed());
    assert_eq!(h.coordinator.connection_count(), 1);

    let missing = h
        .coordinator
        .send_control(Some(&WorkerId::from("ghost")), ControlAction::Stop)
        .await;
    assert_eq!(missing, 0);
    Ok(())
}

#[tokio::test]
async fn failed_submission_keeps_a_reclaimed_lease_with_its_new_holder() -> Result<()> {
    let accounts = Arc::new(FailingSubmissions::default());
    let h = harness_with(quiet_config(), accounts.clone());
    h.seed(1, 2).await?;

    let (w1, mut rx1) = h.register("w1", 1).await?;
    let first = assigned(request_work(&h.coordinator, &w1, &mut rx1).await?)?;
    accounts
        .inner
        .backdate_lease(first[0].id, Utc::now() - chrono::TimeDelta::minutes(11));

    let (w2, mut rx2) = h.register("w2", 1).await?;
    let reclaimed = assigned(request_work(&h.coordinator, &w2, &mut rx2).await?)?;
    assert_eq!(reclaimed[0].id, first[0].id);

    accounts.fail.store(true, Ordering::SeqCst);
    h.coordinator
        .handle_message(
            &w1,
            ClientMessage::SubmitResults {
                results: vec![ResultReport::for_account(first[0].id, "good")],
                resource_report: None,
                batch_info: None,
            },
        )
        .await;
    match next(&mut rx1).await? {
        ServerMessage::Error {
            kind: ErrorKind::Submission,
            ..
        } => {}
        other => bail!("expected submission error, got {other:?}"),
    }

    let account = h.leases.account(first[0].id).await?.expect("account exists");
    assert_eq!(account.status, AccountStatus::Processing);
    assert_eq!(account.lease_holder, Some(WorkerId::from("w2")));
    Ok(())
}

#[tokio::test]
async fn broadcast_skips_a_worker_that_stopped_draining() -> Result<()> {
    let h = harness(CoordinatorConfig {
        outbound_buffer: 2,
        ..quiet_config()
    });
    // Held open but never read.
    let (_stuck, _stuck_rx) = h.register("stuck", 2).await?;
    let (_live, mut live_rx) = h.register("live", 2).await?;

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let sent = tokio::time::timeout(
            Duration::from_secs(2),
            h.coordinator.send_control(None, ControlAction::Pause),
        )
        .await?;
        delivered.push(sent);
        assert_eq!(
            next(&mut live_rx).await?,
            ServerMessage::Control { action: ControlAction::Pause }
        );
    }
    assert_eq!(delivered, vec![2, 2, 1]);
    Ok(())
}
