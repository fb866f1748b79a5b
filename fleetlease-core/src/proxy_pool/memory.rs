use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::ProxyRepository;
use crate::error::Result;
use crate::types::{ProxyCandidate, ProxyId, ProxyLease};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    rows: VecDeque<ProxyLease>,
}

/// Pool held in a single locked queue. Rows stay in insertion order, which
/// `replace_all` callers already sort by response time.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProxyRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryProxyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hosts(&self) -> Vec<String> {
        self.state.lock().rows.iter().map(|p| p.host.clone()).collect()
    }
}

#[async_trait]
impl ProxyRepository for InMemoryProxyRepository {
    async fn take_one(&self) -> Result<Option<ProxyLease>> {
        Ok(self.state.lock().rows.pop_front())
    }

    async fn replace_all(&self, candidates: &[ProxyCandidate], source: &str) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut rows = VecDeque::with_capacity(candidates.len());
        for candidate in candidates {
            state.next_id += 1;
            rows.push_back(ProxyLease {
                id: ProxyId(state.next_id),
                host: candidate.host.clone(),
                port: candidate.port,
                protocol: candidate.protocol,
                username: candidate.username.clone(),
                password: candidate.password.clone(),
                response_time_ms: candidate.response_time_ms,
                source: source.to_string(),
                created_at: now,
            });
        }
        state.rows = rows;
        Ok(state.rows.len() as u64)
    }

    async fn stats(&self) -> Result<(u64, Option<f64>)> {
        let state = self.state.lock();
        let measured: Vec<i64> = state
            .rows
            .iter()
            .filter_map(|p| p.response_time_ms)
            .collect();
        let avg = (!measured.is_empty())
            .then(|| measured.iter().sum::<i64>() as f64 / measured.len() as f64);
        Ok((state.rows.len() as u64, avg))
    }
}
