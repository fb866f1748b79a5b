//! Single-use proxy pool. Checkout deletes the row, so a proxy can only ever
//! be handed out once.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
pub mod refresh;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub use memory::InMemoryProxyRepository;
#[cfg(feature = "database")]
pub use postgres::PostgresProxyRepository;
pub use refresh::{
    ProxyRefresher, ProxySource, RefreshConfig, RefreshEvent, RefreshPhase,
    RefreshStatus, StaticProxySource,
};

use crate::error::{CoreError, Result};
use crate::types::{PoolStats, ProxyCandidate, ProxyLease, ProxyStatusReport, WorkerId};

/// Storage port for the proxy pool.
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Deletes and returns the fastest, then oldest, proxy. `None` when the
    /// pool is empty.
    async fn take_one(&self) -> Result<Option<ProxyLease>>;

    /// Swaps the whole pool for `candidates`, inserted in the given order.
    /// Callers guarantee a non-empty, deduplicated list.
    async fn replace_all(&self, candidates: &[ProxyCandidate], source: &str) -> Result<u64>;

    /// Row count and mean observed response time.
    async fn stats(&self) -> Result<(u64, Option<f64>)>;
}

/// Trims, drops unusable entries, keeps the fastest entry per `host:port`
/// and orders by ascending response time with unmeasured proxies last.
pub fn prepare_candidates(candidates: Vec<ProxyCandidate>) -> Vec<ProxyCandidate> {
    let mut usable: Vec<ProxyCandidate> = candidates
        .into_iter()
        .filter_map(ProxyCandidate::normalized)
        .collect();
    usable.sort_by_key(|c| (c.response_time_ms.is_none(), c.response_time_ms));
    let mut seen = HashSet::new();
    usable.retain(|c| seen.insert((c.host.to_ascii_lowercase(), c.port)));
    usable
}

pub struct ProxyPool {
    repo: Arc<dyn ProxyRepository>,
    reported_success: AtomicU64,
    reported_failure: AtomicU64,
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("reported_success", &self.reported_success.load(Ordering::Relaxed))
            .field("reported_failure", &self.reported_failure.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProxyPool {
    pub fn new(repo: Arc<dyn ProxyRepository>) -> Self {
        Self {
            repo,
            reported_success: AtomicU64::new(0),
            reported_failure: AtomicU64::new(0),
        }
    }

    /// Consumes one proxy for `worker`. There is no way to give it back.
    pub async fn take_one(&self, worker: &WorkerId) -> Result<Option<ProxyLease>> {
        let lease = self.repo.take_one().await?;
        match &lease {
            Some(proxy) => debug!(
                worker_id = %worker,
                proxy_id = %proxy.id,
                host = %proxy.host,
                port = proxy.port,
                "proxy assigned"
            ),
            None => warn!(worker_id = %worker, "proxy pool exhausted"),
        }
        Ok(lease)
    }

    /// Records feedback about a consumed proxy. Never touches the pool.
    pub fn report_status(&self, worker: &WorkerId, report: &ProxyStatusReport) {
        if report.success {
            self.reported_success.fetch_add(1, Ordering::Relaxed);
            debug!(
                worker_id = %worker,
                proxy_id = ?report.proxy_id,
                response_time_ms = ?report.response_time_ms,
                "proxy reported healthy"
            );
        } else {
            self.reported_failure.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id = %worker,
                proxy_id = ?report.proxy_id,
                error = report.error.as_deref().unwrap_or("unspecified"),
                "proxy reported failing"
            );
        }
    }

    /// Replaces the pool. An empty input, or one with nothing usable after
    /// normalization, fails without touching the pool.
    pub async fn replace_all(
        &self,
        candidates: Vec<ProxyCandidate>,
        source: &str,
    ) -> Result<u64> {
        if candidates.is_empty() {
            warn!("refusing to replace proxy pool with an empty list");
            return Err(CoreError::EmptyProxyReplacement);
        }
        let offered = candidates.len();
        let prepared = prepare_candidates(candidates);
        if prepared.is_empty() {
            warn!(offered, "no usable proxies among candidates; pool left unchanged");
            return Err(CoreError::EmptyProxyReplacement);
        }
        let inserted = self.repo.replace_all(&prepared, source).await?;
        info!(offered, inserted, source, "proxy pool replaced");
        Ok(inserted)
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (available, avg_response_time_ms) = self.repo.stats().await?;
        Ok(PoolStats {
            available,
            avg_response_time_ms,
            reported_success: self.reported_success.load(Ordering::Relaxed),
            reported_failure: self.reported_failure.load(Ordering::Relaxed),
        })
    }
}
