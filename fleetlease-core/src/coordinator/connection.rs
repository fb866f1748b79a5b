use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::protocol::ServerMessage;
use crate::types::{
    ConnectionId, CurrentLease, ErrorReport, WorkerId, WorkerSnapshot,
    WorkerStatus, WorkerTelemetry,
};

/// Registered worker state held by its connection.
#[derive(Clone, Debug)]
pub struct WorkerInstance {
    pub worker_id: WorkerId,
    pub batch_size: u32,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub processed: u64,
    pub success: u64,
    pub failure: u64,
    pub current_lease: Option<CurrentLease>,
    errors: VecDeque<ErrorReport>,
    error_capacity: usize,
    /// Set by an error report, cleared by the next assignment.
    faulted: bool,
}

impl WorkerInstance {
    pub fn new(
        worker_id: WorkerId,
        batch_size: u32,
        connected_at: DateTime<Utc>,
        error_capacity: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            batch_size,
            connected_at,
            last_heartbeat: now,
            processed: 0,
            success: 0,
            failure: 0,
            current_lease: None,
            errors: VecDeque::with_capacity(error_capacity.min(64)),
            error_capacity,
            faulted: false,
        }
    }

    /// Working exactly while a lease is held.
    pub fn status(&self) -> WorkerStatus {
        if self.current_lease.is_some() {
            WorkerStatus::Working
        } else if self.faulted {
            WorkerStatus::Error
        } else {
            WorkerStatus::Idle
        }
    }

    pub fn begin_lease(&mut self, lease: CurrentLease) {
        self.current_lease = Some(lease);
        self.faulted = false;
    }

    pub fn record_error(&mut self, report: ErrorReport) {
        if self.error_capacity == 0 {
            return;
        }
        if self.errors.len() == self.error_capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(report);
        self.faulted = true;
    }

    /// Newest last.
    pub fn recent_errors(&self, count: usize) -> Vec<ErrorReport> {
        let skip = self.errors.len().saturating_sub(count);
        self.errors.iter().skip(skip).cloned().collect()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn snapshot(&self, recent_errors: usize, now: DateTime<Utc>) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            status: self.status(),
            batch_size: self.batch_size,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            uptime_secs: (now - self.connected_at).num_seconds(),
            processed: self.processed,
            success: self.success,
            failure: self.failure,
            current_lease: self.current_lease.clone(),
            recent_errors: self.recent_errors(recent_errors),
        }
    }

    pub fn telemetry(&self, now: DateTime<Utc>) -> WorkerTelemetry {
        WorkerTelemetry {
            worker_id: self.worker_id.clone(),
            status: self.status(),
            batch_size: self.batch_size,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            processed: self.processed,
            success: self.success,
            failure: self.failure,
            current_batch: self.current_lease.as_ref().map(|l| l.batch_id.clone()),
            updated_at: now,
        }
    }
}

/// One live transport connection.
pub struct WorkerConnection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
    instance: Mutex<Option<WorkerInstance>>,
    /// Serializes assignment attempts on this connection.
    pub(super) assignment: tokio::sync::Mutex<()>,
}

impl fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker = self.instance.lock().as_ref().map(|i| i.worker_id.clone());
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("worker_id", &worker)
            .field("channel_closed", &self.sender.is_closed())
            .field("cancelled", &self.closed.is_cancelled())
            .finish()
    }
}

impl WorkerConnection {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            connected_at: Utc::now(),
            sender,
            closed: CancellationToken::new(),
            instance: Mutex::new(None),
            assignment: tokio::sync::Mutex::new(()),
        }
    }

    /// Queues a message for the writer task. False once the peer is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.send(message).await.is_ok()
    }

    /// Queues a message without waiting for room. False when the queue is
    /// full or the peer is gone.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(connection_id = %self.id, error = %err, "outbound message dropped");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Fires when the coordinator forces the connection shut.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(super) fn close(&self) {
        self.closed.cancel();
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.instance.lock().as_ref().map(|i| i.worker_id.clone())
    }

    /// Runs `f` against the registered instance, if any.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut WorkerInstance) -> R) -> Option<R> {
        self.instance.lock().as_mut().map(f)
    }

    pub(super) fn install(&self, instance: WorkerInstance) -> Option<WorkerInstance> {
        self.instance.lock().replace(instance)
    }

    pub(super) fn take_instance(&self) -> Option<WorkerInstance> {
        self.instance.lock().take()
    }
}
