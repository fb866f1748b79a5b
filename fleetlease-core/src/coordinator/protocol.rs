//! Worker wire protocol: JSON text frames tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AccountLease, BatchId, ErrorSeverity, ProxyLease, ProxyStatusReport,
    ResultReport, WorkerCapabilities, WorkerId,
};

/// Messages sent by workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(default, alias = "instanceId", alias = "workerId")]
        worker_id: Option<String>,
        #[serde(default)]
        capabilities: WorkerCapabilities,
    },
    RequestWork,
    SubmitResults {
        #[serde(default)]
        results: Vec<ResultReport>,
        #[serde(default, alias = "proxyReport")]
        resource_report: Option<ProxyStatusReport>,
        #[serde(default)]
        batch_info: Option<BatchInfo>,
    },
    Heartbeat {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        current_batch: Option<BatchId>,
    },
    ErrorReport {
        detail: String,
        #[serde(default)]
        severity: Option<ErrorSeverity>,
    },
}

/// Optional timing a worker attaches to a submission.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchInfo {
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default, alias = "processingTime")]
    pub processing_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
    Disconnect,
}

/// Category of a worker-visible failure. Never carries store details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Frame was not valid protocol JSON.
    Protocol,
    /// The worker must register first.
    NotRegistered,
    Assignment,
    Submission,
}

/// Proxy as shipped to a worker, with its connection URL precomputed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAssignment {
    #[serde(flatten)]
    pub lease: ProxyLease,
    pub url: String,
}

impl From<ProxyLease> for ProxyAssignment {
    fn from(lease: ProxyLease) -> Self {
        let url = lease.url();
        Self { lease, url }
    }
}

/// Messages pushed to workers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        worker_id: WorkerId,
        batch_size: u32,
        heartbeat_interval_ms: u64,
    },
    RegistrationError {
        message: String,
    },
    WorkAssigned {
        batch_id: BatchId,
        accounts: Vec<AccountLease>,
        proxy: ProxyAssignment,
    },
    NoWorkAvailable {
        retry_after_ms: u64,
    },
    NoProxyAvailable {
        retry_after_ms: u64,
    },
    ResultsAcknowledged {
        processed_count: usize,
    },
    HeartbeatAck {
        server_time: DateTime<Utc>,
    },
    Control {
        action: ControlAction,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }
}
