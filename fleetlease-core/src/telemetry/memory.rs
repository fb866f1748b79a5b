use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{TelemetryConfig, TelemetryStore};
use crate::error::Result;
use crate::span::secs;
use crate::types::{
    GlobalCounters, PerformanceSample, WorkerId, WorkerTelemetry, WorkerUpdate,
};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Process-local telemetry. TTLs are enforced lazily on read.
#[derive(Clone, Debug)]
pub struct InMemoryTelemetryStore {
    config: TelemetryConfig,
    workers: Arc<DashMap<WorkerId, Expiring<WorkerTelemetry>>>,
    counters: Arc<Mutex<Option<Expiring<GlobalCounters>>>>,
    fleet_samples: Arc<Mutex<Option<Expiring<VecDeque<PerformanceSample>>>>>,
    worker_samples: Arc<DashMap<WorkerId, Expiring<VecDeque<PerformanceSample>>>>,
}

impl Default for InMemoryTelemetryStore {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

impl InMemoryTelemetryStore {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            workers: Arc::new(DashMap::new()),
            counters: Arc::new(Mutex::new(None)),
            fleet_samples: Arc::new(Mutex::new(None)),
            worker_samples: Arc::new(DashMap::new()),
        }
    }

    fn push_sample(
        &self,
        buffer: &mut Expiring<VecDeque<PerformanceSample>>,
        sample: PerformanceSample,
        now: DateTime<Utc>,
    ) {
        if !buffer.live(now) {
            buffer.value.clear();
        }
        buffer.value.push_front(sample);
        buffer.value.truncate(self.config.sample_capacity);
        buffer.expires_at = now + secs(self.config.sample_ttl_secs);
    }
}

fn empty_buffer(now: DateTime<Utc>) -> Expiring<VecDeque<PerformanceSample>> {
    Expiring {
        value: VecDeque::new(),
        expires_at: now,
    }
}

fn prune(buffer: &mut VecDeque<PerformanceSample>, cutoff: DateTime<Utc>) -> u64 {
    let before = buffer.len();
    buffer.retain(|s| s.recorded_at >= cutoff);
    (before - buffer.len()) as u64
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn register_worker(&self, record: WorkerTelemetry) -> Result<()> {
        let expires_at = Utc::now() + secs(self.config.worker_ttl_secs);
        self.workers.insert(
            record.worker_id.clone(),
            Expiring {
                value: record,
                expires_at,
            },
        );
        Ok(())
    }

    async fn unregister_worker(&self, worker: &WorkerId) -> Result<()> {
        self.workers.remove(worker);
        Ok(())
    }

    async fn update_worker(&self, worker: &WorkerId, update: WorkerUpdate) -> Result<()> {
        let now = Utc::now();
        if let Some(mut entry) = self.workers.get_mut(worker) {
            if entry.live(now) {
                update.apply(&mut entry.value, now);
                entry.expires_at = now + secs(self.config.worker_ttl_secs);
            }
        }
        Ok(())
    }

    async fn increment_global_counters(&self, success: u64, failure: u64) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + secs(self.config.counters_ttl_secs);
        let mut guard = self.counters.lock();
        if guard.as_ref().is_some_and(|c| !c.live(now)) {
            *guard = None;
        }
        let entry = guard.get_or_insert_with(|| Expiring {
            value: GlobalCounters::default(),
            expires_at,
        });
        entry.value.total_checked += success + failure;
        entry.value.total_success += success;
        entry.value.total_failure += failure;
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn global_counters(&self) -> Result<GlobalCounters> {
        let now = Utc::now();
        Ok(self
            .counters
            .lock()
            .as_ref()
            .filter(|c| c.live(now))
            .map(|c| c.value.clone())
            .unwrap_or_default())
    }

    async fn append_performance_sample(&self, sample: PerformanceSample) -> Result<()> {
        let now = Utc::now();
        {
            let mut fleet = self.fleet_samples.lock();
            let buffer = fleet.get_or_insert_with(|| empty_buffer(now));
            self.push_sample(buffer, sample.clone(), now);
        }
        let mut buffer = self
            .worker_samples
            .entry(sample.worker_id.clone())
            .or_insert_with(|| empty_buffer(now));
        self.push_sample(&mut buffer, sample, now);
        Ok(())
    }

    async fn performance_samples(
        &self,
        worker: Option<&WorkerId>,
        limit: usize,
    ) -> Result<Vec<PerformanceSample>> {
        let now = Utc::now();
        let take = |buffer: &Expiring<VecDeque<PerformanceSample>>| -> Vec<PerformanceSample> {
            if buffer.live(now) {
                buffer.value.iter().take(limit).cloned().collect()
            } else {
                Vec::new()
            }
        };
        Ok(match worker {
            Some(id) => self
                .worker_samples
                .get(id)
                .map(|entry| take(entry.value()))
                .unwrap_or_default(),
            None => self.fleet_samples.lock().as_ref().map(take).unwrap_or_default(),
        })
    }

    async fn list_workers(&self) -> Result<Vec<WorkerTelemetry>> {
        let now = Utc::now();
        self.workers.retain(|_, entry| entry.live(now));
        let mut workers: Vec<WorkerTelemetry> = self
            .workers
            .iter()
            .map(|entry| entry.value().value.clone())
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn cleanup_older_than(&self, age: chrono::Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - age;
        let mut removed = 0;
        if let Some(fleet) = self.fleet_samples.lock().as_mut() {
            removed += prune(&mut fleet.value, cutoff);
        }
        for mut entry in self.worker_samples.iter_mut() {
            removed += prune(&mut entry.value_mut().value, cutoff);
        }
        self.worker_samples
            .retain(|_, entry| entry.live(now) && !entry.value.is_empty());
        Ok(removed)
    }
}
