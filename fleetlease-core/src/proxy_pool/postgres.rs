use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};

use super::ProxyRepository;
use crate::error::{CoreError, Result};
use crate::types::{Protocol, ProxyCandidate, ProxyId, ProxyLease};

const INSERT_CHUNK: usize = 500;

#[derive(Clone)]
pub struct PostgresProxyRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresProxyRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresProxyRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ProxyRow {
    id: i64,
    host: String,
    port: i32,
    username: Option<String>,
    password: Option<String>,
    protocol: String,
    response_time_ms: Option<i64>,
    source: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProxyRow> for ProxyLease {
    type Error = CoreError;

    fn try_from(row: ProxyRow) -> Result<Self> {
        let port = u16::try_from(row.port).map_err(|_| {
            CoreError::Internal(format!("proxy {} has invalid port {}", row.id, row.port))
        })?;
        Ok(ProxyLease {
            id: ProxyId(row.id),
            host: row.host,
            port,
            protocol: row.protocol.parse::<Protocol>()?,
            username: row.username,
            password: row.password,
            response_time_ms: row.response_time_ms,
            source: row.source,
            created_at: row.created_at,
        })
    }
}

async fn insert_proxies(
    conn: &mut PgConnection,
    candidates: &[ProxyCandidate],
    source: &str,
) -> Result<u64> {
    let mut inserted = 0u64;
    for chunk in candidates.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO proxies \
             (host, port, username, password, protocol, response_time_ms, source) ",
        );
        builder.push_values(chunk, |mut row, candidate| {
            row.push_bind(&candidate.host)
                .push_bind(i32::from(candidate.port))
                .push_bind(&candidate.username)
                .push_bind(&candidate.password)
                .push_bind(candidate.protocol.as_str())
                .push_bind(candidate.response_time_ms)
                .push_bind(source);
        });
        let done = builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| CoreError::Database(format!("proxy insert failed: {e}")))?;
        inserted += done.rows_affected();
    }
    Ok(inserted)
}

#[async_trait]
impl ProxyRepository for PostgresProxyRepository {
    async fn take_one(&self) -> Result<Option<ProxyLease>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoreError::Database(format!("begin take_one tx failed: {e}"))
        })?;

        let row: Option<ProxyRow> = sqlx::query_as(
            r#"
            DELETE FROM proxies
            WHERE id = (
                SELECT id
                FROM proxies
                WHERE status = 'active'
                ORDER BY response_time_ms ASC NULLS LAST, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, host, port, username, password, protocol,
                      response_time_ms, source, created_at
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::Database(format!("proxy take failed: {e}")))?;

        tx.commit().await.map_err(|e| {
            CoreError::Database(format!("take_one tx commit failed: {e}"))
        })?;

        row.map(ProxyLease::try_from).transpose()
    }

    async fn replace_all(&self, candidates: &[ProxyCandidate], source: &str) -> Result<u64> {
        if candidates.is_empty() {
            return Err(CoreError::EmptyProxyReplacement);
        }
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoreError::Database(format!("begin replace_all tx failed: {e}"))
        })?;

        // Blocks concurrent take_one (row locks) until the swap commits.
        sqlx::query("LOCK TABLE proxies IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Database(format!("proxy table lock failed: {e}")))?;

        sqlx::query("DELETE FROM proxies")
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Database(format!("proxy delete failed: {e}")))?;

        let inserted = insert_proxies(&mut tx, candidates, source).await?;

        tx.commit().await.map_err(|e| {
            CoreError::Database(format!("replace_all tx commit failed: {e}"))
        })?;
        Ok(inserted)
    }

    async fn stats(&self) -> Result<(u64, Option<f64>)> {
        let (count, avg): (i64, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*), AVG(response_time_ms)::DOUBLE PRECISION FROM proxies",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::Database(format!("proxy stats failed: {e}")))?;
        Ok((u64::try_from(count).unwrap_or(0), avg))
    }
}
