//! Account queue: batched checkout, result submission and lease release.
//!
//! The repository is the only source of truth for exclusivity. Every
//! operation on [`AccountRepository`] is all-or-nothing.

pub mod config;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub use config::LeaseConfig;
pub use memory::InMemoryAccountRepository;
#[cfg(feature = "database")]
pub use postgres::PostgresAccountRepository;

use crate::error::{CoreError, Result};
use crate::types::{
    AccountId, AccountLease, AccountRecord, AccountStats, AppliedResult,
    BatchCreated, BatchId, BatchRecord, BatchStats, CheckResult,
    ClassifiedResult, NewBatch, ResultBucket, ResultReport, ResultTarget,
    SubmitSummary, WorkerId,
};

/// Which processing accounts a release returns to pending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseScope {
    /// Everything leased to the worker.
    Worker(WorkerId),
    /// The given accounts, whoever holds them.
    Ids(Vec<AccountId>),
    /// The given accounts, only while the worker still holds them.
    Held {
        worker: WorkerId,
        ids: Vec<AccountId>,
    },
}

/// Storage port for accounts and batches.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Inserts the batch and its accounts in one transaction. Accounts whose
    /// email already exists are skipped.
    async fn create_batch(&self, batch: NewBatch) -> Result<BatchCreated>;

    /// Leases up to `limit` accounts that are pending, or processing with a
    /// lease taken before `stale_before`. Oldest first, then fewest attempts.
    async fn checkout(
        &self,
        worker: &WorkerId,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AccountLease>>;

    /// Applies classified results and the batch counter deltas they produce.
    async fn apply_results(
        &self,
        worker: &WorkerId,
        results: Vec<ClassifiedResult>,
    ) -> Result<SubmitSummary>;

    /// Returns processing accounts in `scope` to pending. Returns the count.
    async fn release(&self, scope: ReleaseScope) -> Result<u64>;

    async fn account(&self, id: AccountId) -> Result<Option<AccountRecord>>;

    async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>>;

    /// Most recent batches first.
    async fn list_batches(&self, limit: u32) -> Result<Vec<BatchRecord>>;

    async fn account_stats(&self) -> Result<AccountStats>;

    async fn batch_stats(&self) -> Result<BatchStats>;

    /// Retention: deletes completed accounts checked before `cutoff`.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Per-batch counter increments accumulated while applying one submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BatchDelta {
    pub saved: u32,
    pub good: u32,
    pub bad: u32,
    pub errors: u32,
}

impl BatchDelta {
    fn record(&mut self, bucket: ResultBucket) {
        self.saved += 1;
        match bucket {
            ResultBucket::Good => self.good += 1,
            ResultBucket::Bad => self.bad += 1,
            ResultBucket::Errors => self.errors += 1,
        }
    }
}

/// Groups completions by batch. Ordered so batch rows are always touched in
/// the same order.
pub(crate) fn batch_deltas(
    applied: &[AppliedResult],
) -> BTreeMap<BatchId, BatchDelta> {
    let mut deltas: BTreeMap<BatchId, BatchDelta> = BTreeMap::new();
    for result in applied {
        if let AppliedResult::Completed {
            batch_id, bucket, ..
        } = result
        {
            deltas.entry(batch_id.clone()).or_default().record(*bucket);
        }
    }
    deltas
}

/// Batch ids are unique; a second batch under the same id is rejected
/// before any account is written.
pub(crate) fn duplicate_batch(batch_id: &BatchId) -> CoreError {
    CoreError::InvalidInput(format!("batch {batch_id} already exists"))
}

/// Resolves a raw report into something a repository can apply. `None` when
/// the report names neither an id nor an email.
pub fn classify(report: ResultReport) -> Option<ClassifiedResult> {
    let target = match (report.id, report.email) {
        (Some(id), _) => ResultTarget::Id(id),
        (None, Some(email)) if !email.trim().is_empty() => {
            ResultTarget::Email(email.trim().to_string())
        }
        _ => return None,
    };
    let outcome = CheckResult::normalize(&report.status).outcome();
    Some(ClassifiedResult {
        target,
        outcome,
        raw_status: report.status,
        message: report.message,
        response_time_ms: report.response_time_ms.filter(|ms| *ms >= 0),
    })
}

/// Sorts id-targeted results ahead of email-targeted ones, each by key, so
/// concurrent submissions lock rows in a consistent order.
pub(crate) fn lock_order(results: &mut [ClassifiedResult]) {
    results.sort_by(|a, b| match (&a.target, &b.target) {
        (ResultTarget::Id(x), ResultTarget::Id(y)) => x.cmp(y),
        (ResultTarget::Id(_), ResultTarget::Email(_)) => std::cmp::Ordering::Less,
        (ResultTarget::Email(_), ResultTarget::Id(_)) => {
            std::cmp::Ordering::Greater
        }
        (ResultTarget::Email(x), ResultTarget::Email(y)) => x.cmp(y),
    });
}

/// Owns the account queue and batch aggregates.
#[derive(Clone)]
pub struct LeaseManager {
    repo: Arc<dyn AccountRepository>,
    config: LeaseConfig,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .finish()
    }
}

impl LeaseManager {
    pub fn new(repo: Arc<dyn AccountRepository>, config: LeaseConfig) -> Self {
        Self { repo, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Ingestion boundary. Trims emails, drops blank lines and in-file
    /// repeats before handing the batch to the repository.
    pub async fn create_batch(&self, mut batch: NewBatch) -> Result<BatchCreated> {
        let mut seen = HashSet::new();
        let mut accounts = Vec::with_capacity(batch.accounts.len());
        for mut account in batch.accounts.drain(..) {
            account.email = account.email.trim().to_string();
            if account.email.is_empty() || account.password.is_empty() {
                batch.rejected += 1;
                continue;
            }
            if !seen.insert(account.email.to_ascii_lowercase()) {
                batch.duplicates += 1;
                continue;
            }
            accounts.push(account);
        }
        if accounts.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "batch {} contains no usable accounts",
                batch.batch_id
            )));
        }
        batch.accounts = accounts;

        let created = self.repo.create_batch(batch).await?;
        info!(
            batch_id = %created.batch_id,
            inserted = created.inserted,
            skipped = created.skipped_existing,
            "batch created"
        );
        Ok(created)
    }

    /// Leases up to `size` accounts to `worker`. Empty when nothing is
    /// eligible.
    pub async fn checkout_batch(
        &self,
        worker: &WorkerId,
        size: u32,
    ) -> Result<Vec<AccountLease>> {
        let limit = size.min(self.config.max_checkout);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stale_before = Utc::now() - self.config.lease_duration();
        let leases = self.repo.checkout(worker, limit, stale_before).await?;
        if leases.is_empty() {
            debug!(worker_id = %worker, "no accounts eligible for checkout");
        } else {
            debug!(worker_id = %worker, count = leases.len(), "accounts leased");
        }
        Ok(leases)
    }

    /// Records worker results. Unresolvable reports are skipped and logged.
    pub async fn submit_results(
        &self,
        worker: &WorkerId,
        reports: Vec<ResultReport>,
    ) -> Result<SubmitSummary> {
        let mut unaddressed = 0usize;
        let mut classified = Vec::with_capacity(reports.len());
        for report in reports {
            match classify(report) {
                Some(result) => classified.push(result),
                None => {
                    unaddressed += 1;
                    warn!(worker_id = %worker, "result without id or email skipped");
                }
            }
        }
        lock_order(&mut classified);

        let mut summary = if classified.is_empty() {
            SubmitSummary::default()
        } else {
            self.repo.apply_results(worker, classified).await?
        };
        summary.unresolved += unaddressed;

        for batch in &summary.completed_batches {
            info!(batch_id = %batch, "batch completed");
        }
        debug!(
            worker_id = %worker,
            completed = summary.completed,
            requeued = summary.requeued,
            unresolved = summary.unresolved,
            stale = summary.stale,
            "results applied"
        );
        Ok(summary)
    }

    pub async fn release_by_worker(&self, worker: &WorkerId) -> Result<u64> {
        let released = self.repo.release(ReleaseScope::Worker(worker.clone())).await?;
        if released > 0 {
            info!(worker_id = %worker, released, "released worker leases");
        }
        Ok(released)
    }

    pub async fn release_by_ids(&self, ids: &[AccountId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let released = self.repo.release(ReleaseScope::Ids(ids.to_vec())).await?;
        debug!(requested = ids.len(), released, "released accounts by id");
        Ok(released)
    }

    /// Releases accounts from `leased` that are absent from `reported`, as
    /// long as `worker` still holds them.
    pub async fn release_unreported(
        &self,
        worker: &WorkerId,
        leased: &[AccountId],
        reported: &HashSet<AccountId>,
    ) -> Result<u64> {
        let leftovers: Vec<AccountId> = leased
            .iter()
            .copied()
            .filter(|id| !reported.contains(id))
            .collect();
        let released = self.release_held(worker, &leftovers).await?;
        if released > 0 {
            info!(worker_id = %worker, released, "released unreported accounts");
        }
        Ok(released)
    }

    /// Releases the given accounts only while `worker` still holds them. An
    /// account reclaimed by another worker keeps its new lease.
    pub async fn release_held(&self, worker: &WorkerId, ids: &[AccountId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.repo
            .release(ReleaseScope::Held {
                worker: worker.clone(),
                ids: ids.to_vec(),
            })
            .await
    }

    pub async fn account(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        self.repo.account(id).await
    }

    pub async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>> {
        self.repo.batch(id).await
    }

    pub async fn list_batches(&self, limit: u32) -> Result<Vec<BatchRecord>> {
        self.repo.list_batches(limit).await
    }

    pub async fn account_stats(&self) -> Result<AccountStats> {
        self.repo.account_stats().await
    }

    pub async fn batch_stats(&self) -> Result<BatchStats> {
        self.repo.batch_stats().await
    }

    /// Deletes completed accounts older than the retention window.
    pub async fn cleanup_retention(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.retention();
        let deleted = self.repo.delete_completed_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "retention removed completed accounts");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;

    #[test]
    fn classify_prefers_id_over_email() {
        let report = ResultReport {
            id: Some(AccountId(3)),
            email: Some("a@x".into()),
            status: "good".into(),
            ..ResultReport::default()
        };
        let classified = classify(report).unwrap();
        assert_eq!(classified.target, ResultTarget::Id(AccountId(3)));
        assert_eq!(
            classified.outcome,
            Outcome::Completed(CheckResult::Good, ResultBucket::Good)
        );
    }

    #[test]
    fn classify_rejects_reports_without_target() {
        assert!(classify(ResultReport::for_email("  ", "good")).is_none());
        assert!(classify(ResultReport::default()).is_none());
    }

    #[test]
    fn deltas_group_by_batch() {
        let applied = vec![
            AppliedResult::Completed {
                account_id: AccountId(1),
                batch_id: BatchId::from("b1"),
                bucket: ResultBucket::Good,
            },
            AppliedResult::Completed {
                account_id: AccountId(2),
                batch_id: BatchId::from("b1"),
                bucket: ResultBucket::Errors,
            },
            AppliedResult::Requeued {
                account_id: AccountId(3),
            },
        ];
        let deltas = batch_deltas(&applied);
        let b1 = deltas[&BatchId::from("b1")];
        assert_eq!(b1.saved, 2);
        assert_eq!(b1.good, 1);
        assert_eq!(b1.errors, 1);
        assert_eq!(deltas.len(), 1);
    }
}
