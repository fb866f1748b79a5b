pub mod account;
pub mod batch;
pub mod ids;
pub mod proxy;
pub mod worker;

pub use account::{
    AccountLease, AccountRecord, AccountStats, AccountStatus, AppliedResult,
    CheckResult, ClassifiedResult, NewAccount, Outcome, ResultBucket,
    ResultReport, ResultTarget, SubmitSummary,
};
pub use batch::{
    BatchCounters, BatchCreated, BatchRecord, BatchStats, BatchStatus, NewBatch,
};
pub use ids::{AccountId, BatchId, ConnectionId, ProxyId, WorkerId};
pub use proxy::{
    PoolStats, Protocol, ProxyCandidate, ProxyLease, ProxyStatusReport,
};
pub use worker::{
    CurrentLease, ErrorReport, ErrorSeverity, FleetSummary, GlobalCounters,
    PerformanceSample, WorkerCapabilities, WorkerSnapshot, WorkerStatus,
    WorkerTelemetry, WorkerUpdate,
};
