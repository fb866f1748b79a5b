//! Worker coordination: the only component that knows about individual
//! connections.
//!
//! Per connection the lifecycle is `connected -> registered -> {idle <->
//! working} -> disconnected`. A worker is working exactly while its
//! instance holds a [`CurrentLease`]. Every exit path out of a registered
//! state releases the accounts leased to that worker.

pub mod config;
pub mod connection;
pub mod maintenance;
pub mod protocol;
pub mod registry;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use config::CoordinatorConfig;
pub use connection::{WorkerConnection, WorkerInstance};
pub use protocol::{
    BatchInfo, ClientMessage, ControlAction, ErrorKind, ProxyAssignment,
    ServerMessage,
};
pub use registry::WorkerRegistry;

use crate::leasing::LeaseManager;
use crate::proxy_pool::ProxyPool;
use crate::telemetry::TelemetryStore;
use crate::types::{
    AccountId, BatchId, CheckResult, ConnectionId, CurrentLease, ErrorReport,
    ErrorSeverity, FleetSummary, PerformanceSample, ProxyStatusReport,
    ResultReport, WorkerCapabilities, WorkerId, WorkerSnapshot, WorkerStatus,
    WorkerUpdate,
};

/// Shared services the coordinator drives.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub leases: LeaseManager,
    pub proxies: Arc<ProxyPool>,
    pub telemetry: Arc<dyn TelemetryStore>,
}

impl fmt::Debug for CoordinatorDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorDeps")
            .field("leases", &self.leases)
            .field("proxies", &self.proxies)
            .finish()
    }
}

pub struct Coordinator {
    deps: CoordinatorDeps,
    config: CoordinatorConfig,
    registry: WorkerRegistry,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            registry: WorkerRegistry::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.deps.leases
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.deps.proxies
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetryStore> {
        &self.deps.telemetry
    }

    /// Opens a connection. The receiver yields every message the coordinator
    /// wants delivered to the peer.
    pub fn connect(&self) -> (Arc<WorkerConnection>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let connection = Arc::new(WorkerConnection::new(tx));
        self.registry.add(connection.clone());
        debug!(connection_id = %connection.id, "worker connection opened");
        (connection, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn handle_message(
        self: &Arc<Self>,
        connection: &Arc<WorkerConnection>,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Register {
                worker_id,
                capabilities,
            } => self.register(connection, worker_id.as_deref(), capabilities).await,
            ClientMessage::RequestWork => self.request_work(connection).await,
            ClientMessage::SubmitResults {
                results,
                resource_report,
                batch_info,
            } => {
                self.submit_results(connection, results, resource_report, batch_info)
                    .await
            }
            ClientMessage::Heartbeat {
                status,
                current_batch,
            } => {
                self.heartbeat(connection, status.as_deref(), current_batch.as_ref())
                    .await
            }
            ClientMessage::ErrorReport { detail, severity } => {
                self.report_error(connection, detail, severity).await
            }
        }
    }

    /// Registers the worker on this connection. A blank id is rejected and
    /// the connection stays usable. Another live connection holding the same
    /// id is evicted first.
    pub async fn register(
        self: &Arc<Self>,
        connection: &Arc<WorkerConnection>,
        worker_id: Option<&str>,
        capabilities: WorkerCapabilities,
    ) {
        let Some(worker_id) = worker_id.and_then(WorkerId::parse) else {
            warn!(connection_id = %connection.id, "registration without worker id rejected");
            connection
                .send(ServerMessage::RegistrationError {
                    message: "worker_id is required".to_string(),
                })
                .await;
            return;
        };

        // Re-registering under a new id retires the old identity first.
        if let Some(previous) = connection.worker_id() {
            if previous != worker_id {
                if let Some(old) = connection.take_instance() {
                    self.retire(connection.id, old, "re-registered").await;
                }
            }
        }

        if let Some(stale) = self.registry.bind(worker_id.clone(), connection.id) {
            warn!(
                worker_id = %worker_id,
                stale_connection = %stale,
                "worker id already connected; evicting older connection"
            );
            self.disconnect(stale, "replaced by new registration").await;
        }

        let batch_size = self.config.batch_size_for(capabilities.batch_size);
        let instance = WorkerInstance::new(
            worker_id.clone(),
            batch_size,
            connection.connected_at,
            self.config.error_buffer_size,
        );
        let record = instance.telemetry(Utc::now());
        let lease_holder = connection
            .install(instance)
            .and_then(|prior| prior.current_lease.map(|lease| (prior.worker_id, lease)));
        if let Some((holder, lease)) = lease_holder {
            // Same id registering twice on one connection keeps the lease.
            connection.with_instance(|i| {
                if i.worker_id == holder {
                    i.begin_lease(lease.clone());
                }
            });
        }

        if let Err(err) = self.deps.telemetry.register_worker(record).await {
            warn!(worker_id = %worker_id, error = %err, "telemetry register failed");
        }
        info!(
            worker_id = %worker_id,
            connection_id = %connection.id,
            batch_size,
            version = capabilities.version.as_deref().unwrap_or("unknown"),
            "worker registered"
        );
        connection
            .send(ServerMessage::Registered {
                worker_id,
                batch_size,
                heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            })
            .await;

        self.schedule_assignment(connection, self.config.initial_assignment_delay());
    }

    /// Tries to move an idle worker to working. No-op while already working.
    pub async fn request_work(self: &Arc<Self>, connection: &Arc<WorkerConnection>) {
        let _gate = connection.assignment.lock().await;

        let Some((worker, batch_size, working)) = connection.with_instance(|i| {
            (i.worker_id.clone(), i.batch_size, i.current_lease.is_some())
        }) else {
            connection
                .send(ServerMessage::error(ErrorKind::NotRegistered, "register first"))
                .await;
            return;
        };
        if working {
            debug!(worker_id = %worker, "work requested while working; ignored");
            return;
        }

        let accounts = match self.deps.leases.checkout_batch(&worker, batch_size).await {
            Ok(accounts) => accounts,
            Err(err) => {
                error!(worker_id = %worker, error = %err, "account checkout failed");
                connection
                    .send(ServerMessage::error(
                        ErrorKind::Assignment,
                        "work assignment failed; retry later",
                    ))
                    .await;
                return;
            }
        };
        if accounts.is_empty() {
            connection
                .send(ServerMessage::NoWorkAvailable {
                    retry_after_ms: self.config.no_work_retry_ms,
                })
                .await;
            return;
        }
        let account_ids: Vec<AccountId> = accounts.iter().map(|a| a.id).collect();

        let proxy = match self.deps.proxies.take_one(&worker).await {
            Ok(Some(proxy)) => proxy,
            Ok(None) => {
                self.release_held(&worker, &account_ids).await;
                connection
                    .send(ServerMessage::NoProxyAvailable {
                        retry_after_ms: self.config.no_proxy_retry_ms,
                    })
                    .await;
                return;
            }
            Err(err) => {
                error!(worker_id = %worker, error = %err, "proxy checkout failed");
                self.release_held(&worker, &account_ids).await;
                connection
                    .send(ServerMessage::error(
                        ErrorKind::Assignment,
                        "work assignment failed; retry later",
                    ))
                    .await;
                return;
            }
        };

        let batch_id = accounts[0].batch_id.clone();
        let lease = CurrentLease {
            batch_id: batch_id.clone(),
            account_ids: account_ids.clone(),
            proxy_id: proxy.id,
            assigned_at: Utc::now(),
        };
        let recorded = !connection.is_closed()
            && connection
                .with_instance(|i| {
                    if i.worker_id == worker {
                        i.begin_lease(lease.clone());
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
        if !recorded {
            warn!(
                worker_id = %worker,
                proxy_id = %proxy.id,
                "connection gone during assignment; proxy consumed, accounts released"
            );
            self.release_held(&worker, &account_ids).await;
            return;
        }

        self.mirror(
            &worker,
            WorkerUpdate {
                status: Some(WorkerStatus::Working),
                current_batch: Some(Some(batch_id.clone())),
                ..WorkerUpdate::default()
            },
        )
        .await;

        info!(
            worker_id = %worker,
            accounts = account_ids.len(),
            proxy_id = %proxy.id,
            batch_id = %batch_id,
            "work assigned"
        );
        let delivered = connection
            .send(ServerMessage::WorkAssigned {
                batch_id,
                accounts,
                proxy: proxy.into(),
            })
            .await;
        if !delivered {
            warn!(worker_id = %worker, "work package undeliverable; releasing accounts");
            connection.with_instance(|i| i.current_lease = None);
            self.release_held(&worker, &account_ids).await;
        }
    }

    /// Records results, releases anything the worker did not report on, and
    /// schedules the next assignment after the cooldown.
    pub async fn submit_results(
        self: &Arc<Self>,
        connection: &Arc<WorkerConnection>,
        results: Vec<ResultReport>,
        resource_report: Option<ProxyStatusReport>,
        batch_info: Option<BatchInfo>,
    ) {
        let Some((worker, lease, batch_size)) = connection.with_instance(|i| {
            (i.worker_id.clone(), i.current_lease.take(), i.batch_size)
        }) else {
            connection
                .send(ServerMessage::error(ErrorKind::NotRegistered, "register first"))
                .await;
            return;
        };

        let processed = results.len();
        let success = results
            .iter()
            .filter(|r| CheckResult::normalize(&r.status) == CheckResult::Good)
            .count();
        let failure = processed - success;
        let response_times: Vec<i64> =
            results.iter().filter_map(|r| r.response_time_ms).collect();
        let mut reported: HashSet<AccountId> = results.iter().filter_map(|r| r.id).collect();

        match self.deps.leases.submit_results(&worker, results).await {
            Ok(summary) => {
                reported.extend(summary.completed_ids.iter().copied());
                if let Some(lease) = &lease {
                    if let Err(err) = self
                        .deps
                        .leases
                        .release_unreported(&worker, &lease.account_ids, &reported)
                        .await
                    {
                        error!(worker_id = %worker, error = %err, "leftover release failed");
                    }
                }
            }
            Err(err) => {
                error!(worker_id = %worker, error = %err, "result submission failed");
                if let Some(lease) = &lease {
                    self.release_held(&worker, &lease.account_ids).await;
                }
                connection
                    .send(ServerMessage::error(
                        ErrorKind::Submission,
                        "results could not be recorded",
                    ))
                    .await;
            }
        }

        if let Some(mut report) = resource_report {
            if report.proxy_id.is_none() {
                report.proxy_id = lease.as_ref().map(|l| l.proxy_id);
            }
            self.deps.proxies.report_status(&worker, &report);
        }

        let counters = connection.with_instance(|i| {
            i.processed += processed as u64;
            i.success += success as u64;
            i.failure += failure as u64;
            (i.processed, i.success, i.failure, i.status())
        });
        if let Some((total, ok, failed, status)) = counters {
            self.mirror(
                &worker,
                WorkerUpdate {
                    status: Some(status),
                    processed: Some(total),
                    success: Some(ok),
                    failure: Some(failed),
                    current_batch: Some(None),
                    ..WorkerUpdate::default()
                },
            )
            .await;
        }
        self.record_performance(
            &worker,
            batch_size,
            processed,
            success,
            &response_times,
            lease.as_ref(),
            batch_info.as_ref(),
        )
        .await;

        connection
            .send(ServerMessage::ResultsAcknowledged {
                processed_count: processed,
            })
            .await;
        self.schedule_assignment(connection, self.config.resubmit_cooldown());
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_performance(
        &self,
        worker: &WorkerId,
        batch_size: u32,
        processed: usize,
        success: usize,
        response_times: &[i64],
        lease: Option<&CurrentLease>,
        batch_info: Option<&BatchInfo>,
    ) {
        if processed == 0 {
            return;
        }
        if let Err(err) = self
            .deps
            .telemetry
            .increment_global_counters(success as u64, (processed - success) as u64)
            .await
        {
            warn!(error = %err, "global counter update failed");
        }
        let now = Utc::now();
        let processing_ms = batch_info
            .and_then(|b| b.processing_ms)
            .or_else(|| lease.map(|l| (now - l.assigned_at).num_milliseconds()))
            .unwrap_or(0);
        let avg_response_time_ms = (!response_times.is_empty()).then(|| {
            response_times.iter().sum::<i64>() as f64 / response_times.len() as f64
        });
        let sample = PerformanceSample {
            worker_id: worker.clone(),
            batch_size,
            processing_ms,
            success_rate: success as f64 / processed as f64,
            avg_response_time_ms,
            recorded_at: now,
        };
        if let Err(err) = self.deps.telemetry.append_performance_sample(sample).await {
            warn!(error = %err, "performance sample append failed");
        }
    }

    /// Refreshes liveness and acknowledges with the server clock. The status
    /// and batch a worker reports are logged only; the server derives both
    /// from the lease it holds for the worker, and that view is authoritative.
    pub async fn heartbeat(
        &self,
        connection: &Arc<WorkerConnection>,
        status: Option<&str>,
        current_batch: Option<&BatchId>,
    ) {
        let now = Utc::now();
        let worker = connection.with_instance(|i| {
            i.last_heartbeat = now;
            i.worker_id.clone()
        });
        if let Some(worker) = worker {
            debug!(
                worker_id = %worker,
                reported_status = ?status,
                reported_batch = ?current_batch,
                "heartbeat"
            );
            self.mirror(
                &worker,
                WorkerUpdate {
                    last_heartbeat: Some(now),
                    ..WorkerUpdate::default()
                },
            )
            .await;
        }
        connection
            .send(ServerMessage::HeartbeatAck { server_time: now })
            .await;
    }

    /// Buffers a worker-reported error. Never replies.
    pub async fn report_error(
        &self,
        connection: &Arc<WorkerConnection>,
        detail: String,
        severity: Option<ErrorSeverity>,
    ) {
        let report = ErrorReport {
            detail,
            severity,
            reported_at: Utc::now(),
        };
        let recorded = connection.with_instance(|i| {
            i.record_error(report.clone());
            (i.worker_id.clone(), i.status())
        });
        match recorded {
            Some((worker, status)) => {
                warn!(
                    worker_id = %worker,
                    severity = ?report.severity,
                    detail = %report.detail,
                    "worker reported error"
                );
                self.mirror(
                    &worker,
                    WorkerUpdate {
                        status: Some(status),
                        ..WorkerUpdate::default()
                    },
                )
                .await;
            }
            None => debug!(connection_id = %connection.id, "error report before registration ignored"),
        }
    }

    /// Pushes a control command to one worker, or to every registered worker
    /// when `target` is `None`. `Disconnect` also closes the connection.
    /// A worker whose outbound queue is full is skipped rather than waited
    /// on. Returns how many workers received the command.
    pub async fn send_control(&self, target: Option<&WorkerId>, action: ControlAction) -> usize {
        let targets: Vec<Arc<WorkerConnection>> = match target {
            Some(worker) => self.registry.lookup(worker).into_iter().collect(),
            None => self
                .registry
                .all()
                .into_iter()
                .filter(|c| c.worker_id().is_some())
                .collect(),
        };
        let mut delivered = 0;
        for connection in targets {
            if connection.try_send(ServerMessage::Control { action }) {
                delivered += 1;
            }
            if action == ControlAction::Disconnect {
                self.disconnect(connection.id, "disconnect command").await;
            }
        }
        info!(?action, target = ?target, delivered, "control command sent");
        delivered
    }

    /// Tears down a connection from any state. Idempotent.
    pub async fn disconnect(&self, connection_id: ConnectionId, reason: &str) {
        let Some(connection) = self.registry.remove(connection_id) else {
            return;
        };
        connection.close();
        match connection.take_instance() {
            Some(instance) => self.retire(connection_id, instance, reason).await,
            None => debug!(%connection_id, reason, "unregistered connection closed"),
        }
    }

    /// Releases everything a worker identity holds and drops its telemetry.
    async fn retire(&self, connection_id: ConnectionId, instance: WorkerInstance, reason: &str) {
        let worker = instance.worker_id;
        self.registry.unbind(&worker, connection_id);
        if let Err(err) = self.deps.leases.release_by_worker(&worker).await {
            error!(worker_id = %worker, error = %err, "lease release on disconnect failed");
        }
        // A newer connection may have re-registered this id already.
        if self.registry.lookup(&worker).is_none() {
            if let Err(err) = self.deps.telemetry.unregister_worker(&worker).await {
                warn!(worker_id = %worker, error = %err, "telemetry unregister failed");
            }
        }
        info!(worker_id = %worker, %connection_id, reason, "worker disconnected");
    }

    /// Evicts registered workers whose last heartbeat is older than the
    /// timeout, and connections that never registered within it.
    pub async fn sweep_stale(&self) -> usize {
        let cutoff = Utc::now() - self.config.heartbeat_timeout();
        let stale: Vec<ConnectionId> = self
            .registry
            .all()
            .into_iter()
            .filter(|c| {
                c.with_instance(|i| i.last_heartbeat < cutoff)
                    .unwrap_or(c.connected_at < cutoff)
            })
            .map(|c| c.id)
            .collect();
        for id in &stale {
            self.disconnect(*id, "heartbeat timeout").await;
        }
        if !stale.is_empty() {
            warn!(evicted = stale.len(), "liveness sweep evicted stale workers");
        }
        stale.len()
    }

    /// Dashboard view of every registered worker, sorted by id.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Utc::now();
        let mut workers: Vec<WorkerSnapshot> = self
            .registry
            .all()
            .iter()
            .filter_map(|c| {
                c.with_instance(|i| i.snapshot(self.config.snapshot_error_count, now))
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn summary(&self) -> FleetSummary {
        let statuses: Vec<_> = self
            .registry
            .all()
            .iter()
            .filter_map(|c| c.with_instance(|i| i.status()))
            .collect();
        FleetSummary::tally(statuses.iter())
    }

    fn schedule_assignment(self: &Arc<Self>, connection: &Arc<WorkerConnection>, delay: Duration) {
        let coordinator = Arc::clone(self);
        let connection = Arc::clone(connection);
        let closed = connection.closed_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !connection.is_closed() {
                        coordinator.request_work(&connection).await;
                    }
                }
            }
        });
    }

    /// Accounts another worker has since reclaimed stay with that worker.
    async fn release_held(&self, worker: &WorkerId, ids: &[AccountId]) {
        if let Err(err) = self.deps.leases.release_held(worker, ids).await {
            error!(worker_id = %worker, error = %err, "account release failed");
        }
    }

    async fn mirror(&self, worker: &WorkerId, update: WorkerUpdate) {
        if let Err(err) = self.deps.telemetry.update_worker(worker, update).await {
            warn!(worker_id = %worker, error = %err, "telemetry update failed");
        }
    }
}
