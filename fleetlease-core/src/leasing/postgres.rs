//! Postgres-backed account queue.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};

use super::{AccountRepository, BatchDelta, ReleaseScope, batch_deltas, duplicate_batch};
use crate::error::{CoreError, Result};
use crate::types::{
    AccountId, AccountLease, AccountRecord, AccountStats, AccountStatus,
    AppliedResult, BatchCounters, BatchCreated, BatchId, BatchRecord,
    BatchStats, BatchStatus, CheckResult, ClassifiedResult, NewAccount,
    NewBatch, Outcome, ResultTarget, SubmitSummary, WorkerId,
};

const INSERT_CHUNK: usize = 500;

#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresAccountRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresAccountRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    email: String,
    password: String,
    batch_id: String,
    position: i32,
    status: String,
    result: String,
    lease_holder: Option<String>,
    leased_at: Option<DateTime<Utc>>,
    attempts: i32,
    result_message: Option<String>,
    response_time_ms: Option<i64>,
    checked_by: Option<String>,
    checked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for AccountRecord {
    type Error = CoreError;

    fn try_from(row: AccountRow) -> Result<Self> {
        let status = AccountStatus::from_stored(&row.status).ok_or_else(|| {
            CoreError::Internal(format!("unknown account status '{}'", row.status))
        })?;
        let result = CheckResult::from_stored(&row.result).ok_or_else(|| {
            CoreError::Internal(format!("unknown account result '{}'", row.result))
        })?;
        Ok(AccountRecord {
            id: AccountId(row.id),
            email: row.email,
            password: row.password,
            batch_id: BatchId(row.batch_id),
            position: row.position,
            status,
            result,
            lease_holder: row.lease_holder.map(WorkerId),
            leased_at: row.leased_at,
            attempts: row.attempts,
            result_message: row.result_message,
            response_time_ms: row.response_time_ms,
            checked_by: row.checked_by.map(WorkerId),
            checked_at: row.checked_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct LeasedRow {
    id: i64,
    email: String,
    password: String,
    batch_id: String,
    position: i32,
    attempts: i32,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BatchRow {
    batch_id: String,
    file_name: String,
    account_count: i32,
    status: String,
    stats_saved: i32,
    stats_good: i32,
    stats_bad: i32,
    stats_errors: i32,
    stats_duplicates: i32,
    stats_rejected: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

fn counter(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = CoreError;

    fn try_from(row: BatchRow) -> Result<Self> {
        let status = BatchStatus::from_stored(&row.status).ok_or_else(|| {
            CoreError::Internal(format!("unknown batch status '{}'", row.status))
        })?;
        Ok(BatchRecord {
            batch_id: BatchId(row.batch_id),
            file_name: row.file_name,
            account_count: counter(row.account_count),
            status,
            counters: BatchCounters {
                saved: counter(row.stats_saved),
                good: counter(row.stats_good),
                bad: counter(row.stats_bad),
                errors: counter(row.stats_errors),
                duplicates: counter(row.stats_duplicates),
                rejected: counter(row.stats_rejected),
            },
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

const BATCH_COLUMNS: &str = "batch_id, file_name, account_count, status, \
    stats_saved, stats_good, stats_bad, stats_errors, stats_duplicates, \
    stats_rejected, started_at, completed_at, created_at";

const ACCOUNT_COLUMNS: &str = "id, email, password, batch_id, position, status, \
    result, lease_holder, leased_at, attempts, result_message, \
    response_time_ms, checked_by, checked_at, created_at";

#[derive(FromRow)]
struct LockedAccount {
    id: i64,
    batch_id: String,
    status: String,
    lease_holder: Option<String>,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_accounts(
    conn: &mut PgConnection,
    batch_id: &BatchId,
    accounts: &[NewAccount],
) -> Result<u32> {
    let mut inserted = 0u32;
    for (chunk_index, chunk) in accounts.chunks(INSERT_CHUNK).enumerate() {
        let offset = chunk_index * INSERT_CHUNK;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO accounts (email, password, batch_id, position) ");
        builder.push_values(chunk.iter().enumerate(), |mut row, (i, account)| {
            let position = i32::try_from(offset + i).unwrap_or(i32::MAX);
            row.push_bind(&account.email)
                .push_bind(&account.password)
                .push_bind(batch_id.as_str())
                .push_bind(position);
        });
        builder.push(" ON CONFLICT (email) DO NOTHING");
        let done = builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| CoreError::Database(format!("account insert failed: {e}")))?;
        inserted += u32::try_from(done.rows_affected()).unwrap_or(u32::MAX);
    }
    Ok(inserted)
}

async fn lock_account(
    conn: &mut PgConnection,
    target: &ResultTarget,
) -> Result<Option<LockedAccount>> {
    let query = match target {
        ResultTarget::Id(id) => sqlx::query_as::<_, LockedAccount>(
            "SELECT id, batch_id, status, lease_holder FROM accounts \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0),
        ResultTarget::Email(email) => sqlx::query_as::<_, LockedAccount>(
            "SELECT id, batch_id, status, lease_holder FROM accounts \
             WHERE email = $1 FOR UPDATE",
        )
        .bind(email.as_str()),
    };
    query
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| CoreError::Database(format!("result lookup failed: {e}")))
}

async fn complete_account(
    conn: &mut PgConnection,
    id: i64,
    worker: &WorkerId,
    result: CheckResult,
    message: Option<&str>,
    response_time_ms: Option<i64>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts
        SET status = 'completed',
            result = $2,
            lease_holder = NULL,
            leased_at = NULL,
            result_message = $3,
            response_time_ms = $4,
            checked_by = $5,
            checked_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(result.as_str())
    .bind(message)
    .bind(response_time_ms)
    .bind(worker.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| CoreError::Database(format!("result update failed: {e}")))?;
    Ok(())
}

async fn requeue_account(conn: &mut PgConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts
        SET status = 'pending',
            lease_holder = NULL,
            leased_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(|e| CoreError::Database(format!("requeue update failed: {e}")))?;
    Ok(())
}

/// Applies counter increments in place. Returns true when this update is
/// the one that brought the batch to full coverage.
async fn bump_batch(
    conn: &mut PgConnection,
    batch_id: &BatchId,
    delta: BatchDelta,
) -> Result<bool> {
    let completed_now: Option<bool> = sqlx::query_scalar(
        r#"
        UPDATE batches
        SET stats_saved = stats_saved + $2,
            stats_good = stats_good + $3,
            stats_bad = stats_bad + $4,
            stats_errors = stats_errors + $5,
            status = CASE
                WHEN stats_saved + $2 >= account_count THEN 'completed'
                ELSE status
            END,
            completed_at = CASE
                WHEN stats_saved + $2 >= account_count THEN COALESCE(completed_at, NOW())
                ELSE completed_at
            END,
            updated_at = NOW()
        WHERE batch_id = $1
        RETURNING stats_saved >= account_count AND stats_saved - $2 < account_count
        "#,
    )
    .bind(batch_id.as_str())
    .bind(delta.saved as i32)
    .bind(delta.good as i32)
    .bind(delta.bad as i32)
    .bind(delta.errors as i32)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| CoreError::Database(format!("batch counter update failed: {e}")))?;
    Ok(completed_now.unwrap_or(false))
}

async fn release_scope(conn: &mut PgConnection, scope: &ReleaseScope) -> Result<u64> {
    let query = match scope {
        ReleaseScope::Worker(worker) => sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'pending', lease_holder = NULL, leased_at = NULL, updated_at = NOW()
            WHERE status = 'processing' AND lease_holder = $1
            "#,
        )
        .bind(worker.as_str()),
        ReleaseScope::Ids(ids) => sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'pending', lease_holder = NULL, leased_at = NULL, updated_at = NOW()
            WHERE status = 'processing' AND id = ANY($1)
            "#,
        )
        .bind(ids.iter().map(|id| id.0).collect::<Vec<i64>>()),
        ReleaseScope::Held { worker, ids } => sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'pending', lease_holder = NULL, leased_at = NULL, updated_at = NOW()
            WHERE status = 'processing' AND lease_holder = $1 AND id = ANY($2)
            "#,
        )
        .bind(worker.as_str())
        .bind(ids.iter().map(|id| id.0).collect::<Vec<i64>>()),
    };
    let done = query
        .execute(&mut *conn)
        .await
        .map_err(|e| CoreError::Database(format!("release update failed: {e}")))?;
    Ok(done.rows_affected())
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn create_batch(&self, batch: NewBatch) -> Result<BatchCreated> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoreError::Database(format!("begin create_batch tx failed: {e}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO batches (batch_id, file_name, stats_duplicates, stats_rejected)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(batch.batch_id.as_str())
        .bind(&batch.file_name)
        .bind(batch.duplicates as i32)
        .bind(batch.rejected as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return duplicate_batch(&batch.batch_id);
                }
            }
            CoreError::Database(format!("batch insert failed: {e}"))
        })?;

        let inserted = insert_accounts(&mut tx, &batch.batch_id, &batch.accounts).await?;
        let skipped = u32::try_from(batch.accounts.len())
            .unwrap_or(u32::MAX)
            .saturating_sub(inserted);

        sqlx::query(
            r#"
            UPDATE batches
            SET account_count = $2,
                status = CASE WHEN $2 = 0 THEN 'completed' ELSE status END,
                completed_at = CASE WHEN $2 = 0 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch.batch_id.as_str())
        .bind(inserted as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::Database(format!("batch count update failed: {e}")))?;

        tx.commit().await.map_err(|e| {
            CoreError::Database(format!("create_batch tx commit failed: {e}"))
        })?;

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
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoreError::Database(format!("begin checkout tx failed: {e}"))
        })?;

        let mut rows: Vec<LeasedRow> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT id
                FROM accounts
                WHERE status = 'pending'
                   OR (status = 'processing' AND leased_at < $3)
                ORDER BY created_at, attempts, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE accounts a
            SET status = 'processing',
                lease_holder = $1,
                leased_at = NOW(),
                attempts = a.attempts + 1,
                updated_at = NOW()
            FROM picked
            WHERE a.id = picked.id
            RETURNING a.id, a.email, a.password, a.batch_id, a.position,
                      a.attempts, a.created_at
            "#,
        )
        .bind(worker.as_str())
        .bind(i64::from(limit))
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| CoreError::Database(format!("checkout update failed: {e}")))?;

        if rows.is_empty() {
            tx.commit().await.map_err(|e| {
                CoreError::Database(format!("checkout tx commit failed: {e}"))
            })?;
            return Ok(Vec::new());
        }

        // RETURNING does not preserve the CTE order.
        rows.sort_by_key(|r| (r.created_at, r.attempts, r.id));

        let mut touched: Vec<String> = rows.iter().map(|r| r.batch_id.clone()).collect();
        touched.sort();
        touched.dedup();
        sqlx::query(
            r#"
            UPDATE batches
            SET status = 'processing',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE batch_id = ANY($1) AND status = 'queued'
            "#,
        )
        .bind(&touched)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::Database(format!("batch start update failed: {e}")))?;

        tx.commit().await.map_err(|e| {
            CoreError::Database(format!("checkout tx commit failed: {e}"))
        })?;

        Ok(rows
            .into_iter()
            .map(|r| AccountLease {
                id: AccountId(r.id),
                email: r.email,
                password: r.password,
                batch_id: BatchId(r.batch_id),
                position: r.position,
                attempts: r.attempts,
            })
            .collect())
    }

    async fn apply_results(
        &self,
        worker: &WorkerId,
        results: Vec<ClassifiedResult>,
    ) -> Result<SubmitSummary> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoreError::Database(format!("begin submit tx failed: {e}"))
        })?;

        let mut applied = Vec::with_capacity(results.len());
        for result in results {
            let Some(locked) = lock_account(&mut tx, &result.target).await? else {
                warn!(
                    worker_id = %worker,
                    target = ?result.target,
                    "result for unknown account skipped"
                );
                applied.push(AppliedResult::Unresolved);
                continue;
            };
            let account_id = AccountId(locked.id);
            if locked.status == AccountStatus::Completed.as_str() {
                applied.push(AppliedResult::AlreadyCompleted { account_id });
                continue;
            }
            match result.outcome {
                Outcome::Completed(classification, bucket) => {
                    complete_account(
                        &mut tx,
                        locked.id,
                        worker,
                        classification,
                        result.message.as_deref(),
                        result.response_time_ms,
                    )
                    .await?;
                    applied.push(AppliedResult::Completed {
                        account_id,
                        batch_id: BatchId(locked.batch_id),
                        bucket,
                    });
                }
                Outcome::Inconclusive(_) => {
                    let held = locked.status == AccountStatus::Processing.as_str()
                        && locked.lease_holder.as_deref() == Some(worker.as_str());
                    if held {
                        requeue_account(&mut tx, locked.id).await?;
                        applied.push(AppliedResult::Requeued { account_id });
                    } else {
                        applied.push(AppliedResult::NotHeld { account_id });
                    }
                }
            }
        }

        let mut summary = SubmitSummary::default();
        for (batch_id, delta) in batch_deltas(&applied) {
            if bump_batch(&mut tx, &batch_id, delta).await? {
                summary.completed_batches.push(batch_id);
            }
        }

        tx.commit().await.map_err(|e| {
            CoreError::Database(format!("submit tx commit failed: {e}"))
        })?;

        for result in applied {
            summary.absorb(result);
        }
        Ok(summary)
    }

    async fn release(&self, scope: ReleaseScope) -> Result<u64> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            CoreError::Database(format!("acquire connection failed: {e}"))
        })?;
        release_scope(&mut conn, &scope).await
    }

    async fn account(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("account lookup failed: {e}")))?;
        row.map(AccountRecord::try_from).transpose()
    }

    async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>> {
        let row: Option<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("batch lookup failed: {e}")))?;
        row.map(BatchRecord::try_from).transpose()
    }

    async fn list_batches(&self, limit: u32) -> Result<Vec<BatchRecord>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             ORDER BY created_at DESC, batch_id DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("batch list failed: {e}")))?;
        rows.into_iter().map(BatchRecord::try_from).collect()
    }

    async fn account_stats(&self) -> Result<AccountStats> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT status, result, COUNT(*) FROM accounts GROUP BY status, result",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("account stats failed: {e}")))?;

        let mut stats = AccountStats::default();
        let mut by_result: BTreeMap<String, u64> = BTreeMap::new();
        for (status, result, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            match AccountStatus::from_stored(&status) {
                Some(AccountStatus::Pending) => stats.pending += count,
                Some(AccountStatus::Processing) => stats.processing += count,
                Some(AccountStatus::Completed) => {
                    stats.completed += count;
                    *by_result.entry(result).or_default() += count;
                }
                None => warn!(%status, "unexpected account status in stats"),
            }
        }
        stats.by_result = by_result;
        Ok(stats)
    }

    async fn batch_stats(&self) -> Result<BatchStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM batches GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| CoreError::Database(format!("batch stats failed: {e}")))?;

        let mut stats = BatchStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            match BatchStatus::from_stored(&status) {
                Some(BatchStatus::Queued) => stats.queued += count,
                Some(BatchStatus::Processing) => stats.processing += count,
                Some(BatchStatus::Completed) => stats.completed += count,
                None => warn!(%status, "unexpected batch status in stats"),
            }
        }
        Ok(stats)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(
            "DELETE FROM accounts WHERE status = 'completed' AND checked_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("retention delete failed: {e}")))?;
        if done.rows_affected() > 0 {
            info!(deleted = done.rows_affected(), "retention delete applied");
        }
        Ok(done.rows_affected())
    }
}
