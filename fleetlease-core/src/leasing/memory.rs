//! In-memory account repository for tests and single-process runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AccountRepository, ReleaseScope, batch_deltas, duplicate_batch};
use crate::error::Result;
use crate::types::{
    AccountId, AccountLease, AccountRecord, AccountStats, AccountStatus,
    AppliedResult, BatchCounters, BatchCreated, BatchId, BatchRecord,
    BatchStats, BatchStatus, CheckResult, ClassifiedResult, NewBatch, Outcome,
    ResultTarget, SubmitSummary, WorkerId,
};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    accounts: BTreeMap<AccountId, AccountRecord>,
    by_email: HashMap<String, AccountId>,
    batches: HashMap<BatchId, BatchRecord>,
}

impl State {
    fn resolve(&self, target: &ResultTarget) -> Option<AccountId> {
        match target {
            ResultTarget::Id(id) => self.accounts.contains_key(id).then_some(*id),
            ResultTarget::Email(email) => self.by_email.get(email).copied(),
        }
    }
}

/// Every operation runs under one lock, which gives the same all-or-nothing
/// behaviour as a transaction.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAccountRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdates a lease. Lets tests exercise lease-age reclaim without
    /// waiting out the lease duration.
    pub fn backdate_lease(&self, id: AccountId, leased_at: DateTime<Utc>) {
        if let Some(account) = self.state.lock().accounts.get_mut(&id) {
            if account.status == AccountStatus::Processing {
                account.leased_at = Some(leased_at);
            }
        }
    }

    /// Backdates a completion so retention can be exercised.
    pub fn backdate_checked(&self, id: AccountId, checked_at: DateTime<Utc>) {
        if let Some(account) = self.state.lock().accounts.get_mut(&id) {
            account.checked_at = Some(checked_at);
        }
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn create_batch(&self, batch: NewBatch) -> Result<BatchCreated> {
        let mut state = self.state.lock();
        if state.batches.contains_key(&batch.batch_id) {
            return Err(duplicate_batch(&batch.batch_id));
        }
        let now = Utc::now();
        let mut inserted = 0u32;
        let mut skipped = 0u32;

        for (position, account) in batch.accounts.into_iter().enumerate() {
            if state.by_email.contains_key(&account.email) {
                skipped += 1;
                continue;
            }
            state.next_id += 1;
            let id = AccountId(state.next_id);
            state.by_email.insert(account.email.clone(), id);
            state.accounts.insert(
                id,
                AccountRecord {
                    id,
                    email: account.email,
                    password: account.password,
                    batch_id: batch.batch_id.clone(),
                    position: i32::try_from(position).unwrap_or(i32::MAX),
                    status: AccountStatus::Pending,
                    result: CheckResult::Pending,
                    lease_holder: None,
                    leased_at: None,
                    attempts: 0,
                    result_message: None,
                    response_time_ms: None,
                    checked_by: None,
                    checked_at: None,
                    created_at: now,
                },
            );
            inserted += 1;
        }

        let empty = inserted == 0;
        state.batches.insert(
            batch.batch_id.clone(),
            BatchRecord {
                batch_id: batch.batch_id.clone(),
                file_name: batch.file_name,
                account_count: inserted,
                status: if empty {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Queued
                },
                counters: BatchCounters {
                    duplicates: batch.duplicates,
                    rejected: batch.rejected,
                    ..BatchCounters::default()
                },
                started_at: None,
                completed_at: empty.then_some(now),
                created_at: now,
            },
        );

        Ok(BatchCreated {
            batch_id: batch.batch_id,
            inserted,
            skipped_existing: skipped,
        })
    }

    async fn checkout(
        &self,
        worker: &WorkerId,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AccountLease>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let mut eligible: Vec<&AccountRecord> = state
            .accounts
            .values()
            .filter(|a| match a.status {
                AccountStatus::Pending => true,
                AccountStatus::Processing => {
                    a.leased_at.is_some_and(|at| at < stale_before)
                }
                AccountStatus::Completed => false,
            })
            .collect();
        eligible.sort_by_key(|a| (a.created_at, a.attempts, a.id));
        let picked: Vec<AccountId> = eligible
            .into_iter()
            .take(limit as usize)
            .map(|a| a.id)
            .collect();

        let mut leases = Vec::with_capacity(picked.len());
        for id in picked {
            let Some(account) = state.accounts.get_mut(&id) else {
                continue;
            };
            account.status = AccountStatus::Processing;
            account.lease_holder = Some(worker.clone());
            account.leased_at = Some(now);
            account.attempts += 1;
            leases.push(AccountLease {
                id,
                email: account.email.clone(),
                password: account.password.clone(),
                batch_id: account.batch_id.clone(),
                position: account.position,
                attempts: account.attempts,
            });
        }

        for lease in &leases {
            if let Some(batch) = state.batches.get_mut(&lease.batch_id) {
                if batch.status == BatchStatus::Queued {
                    batch.status = BatchStatus::Processing;
                    batch.started_at.get_or_insert(now);
                }
            }
        }
        Ok(leases)
    }

    async fn apply_results(
        &self,
        worker: &WorkerId,
        results: Vec<ClassifiedResult>,
    ) -> Result<SubmitSummary> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut summary = SubmitSummary::default();
        let mut applied = Vec::with_capacity(results.len());

        for result in results {
            let Some(id) = state.resolve(&result.target) else {
                tracing::warn!(
                    worker_id = %worker,
                    target = ?result.target,
                    "result for unknown account skipped"
                );
                applied.push(AppliedResult::Unresolved);
                continue;
            };
            let Some(account) = state.accounts.get_mut(&id) else {
                applied.push(AppliedResult::Unresolved);
                continue;
            };
            if account.status == AccountStatus::Completed {
                applied.push(AppliedResult::AlreadyCompleted { account_id: id });
                continue;
            }
            match result.outcome {
                Outcome::Completed(classification, bucket) => {
                    account.status = AccountStatus::Completed;
                    account.result = classification;
                    account.lease_holder = None;
                    account.leased_at = None;
                    account.result_message = result.message;
                    account.response_time_ms = result.response_time_ms;
                    account.checked_by = Some(worker.clone());
                    account.checked_at = Some(now);
                    applied.push(AppliedResult::Completed {
                        account_id: id,
                        batch_id: account.batch_id.clone(),
                        bucket,
                    });
                }
                Outcome::Inconclusive(_) => {
                    let held = account.status == AccountStatus::Processing
                        && account.lease_holder.as_ref() == Some(worker);
                    if held {
                        account.status = AccountStatus::Pending;
                        account.lease_holder = None;
                        account.leased_at = None;
                        applied.push(AppliedResult::Requeued { account_id: id });
                    } else {
                        applied.push(AppliedResult::NotHeld { account_id: id });
                    }
                }
            }
        }

        for (batch_id, delta) in batch_deltas(&applied) {
            let Some(batch) = state.batches.get_mut(&batch_id) else {
                continue;
            };
            let was_complete = batch.counters.saved >= batch.account_count;
            batch.counters.saved += delta.saved;
            batch.counters.good += delta.good;
            batch.counters.bad += delta.bad;
            batch.counters.errors += delta.errors;
            if batch.counters.saved >= batch.account_count {
                batch.status = BatchStatus::Completed;
                batch.completed_at.get_or_insert(now);
                if !was_complete {
                    summary.completed_batches.push(batch_id);
                }
            }
        }

        for result in applied {
            summary.absorb(result);
        }
        Ok(summary)
    }

    async fn release(&self, scope: ReleaseScope) -> Result<u64> {
        let mut state = self.state.lock();
        let mut released = 0u64;
        let mut reset = |account: &mut AccountRecord| {
            if account.status == AccountStatus::Processing {
                account.status = AccountStatus::Pending;
                account.lease_holder = None;
                account.leased_at = None;
                released += 1;
            }
        };
        match scope {
            ReleaseScope::Worker(worker) => {
                for account in state.accounts.values_mut() {
                    if account.lease_holder.as_ref() == Some(&worker) {
                        reset(account);
                    }
                }
            }
            ReleaseScope::Ids(ids) => {
                for id in ids {
                    if let Some(account) = state.accounts.get_mut(&id) {
                        reset(account);
                    }
                }
            }
            ReleaseScope::Held { worker, ids } => {
                for id in ids {
                    if let Some(account) = state.accounts.get_mut(&id) {
                        if account.lease_holder.as_ref() == Some(&worker) {
                            reset(account);
                        }
                    }
                }
            }
        }
        Ok(released)
    }

    async fn account(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        Ok(self.state.lock().accounts.get(&id).cloned())
    }

    async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>> {
        Ok(self.state.lock().batches.get(id).cloned())
    }

    async fn list_batches(&self, limit: u32) -> Result<Vec<BatchRecord>> {
        let state = self.state.lock();
        let mut batches: Vec<BatchRecord> = state.batches.values().cloned().collect();
        batches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.batch_id.cmp(&a.batch_id))
        });
        batches.truncate(limit as usize);
        Ok(batches)
    }

    async fn account_stats(&self) -> Result<AccountStats> {
        let state = self.state.lock();
        let mut stats = AccountStats::default();
        for account in state.accounts.values() {
            stats.total += 1;
            match account.status {
                AccountStatus::Pending => stats.pending += 1,
                AccountStatus::Processing => stats.processing += 1,
                AccountStatus::Completed => {
                    stats.completed += 1;
                    *stats
                        .by_result
                        .entry(account.result.as_str().to_string())
                        .or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn batch_stats(&self) -> Result<BatchStats> {
        let state = self.state.lock();
        let mut stats = BatchStats::default();
        for batch in state.batches.values() {
            stats.total += 1;
            match batch.status {
                BatchStatus::Queued => stats.queued += 1,
                BatchStatus::Processing => stats.processing += 1,
                BatchStatus::Completed => stats.completed += 1,
            }
        }
        Ok(stats)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let doomed: Vec<(AccountId, String)> = state
            .accounts
            .values()
            .filter(|a| {
                a.status == AccountStatus::Completed
                    && a.checked_at.is_some_and(|at| at < cutoff)
            })
            .map(|a| (a.id, a.email.clone()))
            .collect();
        for (id, email) in &doomed {
            state.accounts.remove(id);
            state.by_email.remove(email);
        }
        Ok(doomed.len() as u64)
    }
}
