use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{TelemetryConfig, TelemetryStore};
use crate::error::{CoreError, Result};
use crate::types::{
    GlobalCounters, PerformanceSample, WorkerId, WorkerTelemetry, WorkerUpdate,
};

/// Key layout shared by every fleetlease process pointed at the same Redis.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryKeys;

impl TelemetryKeys {
    pub fn worker(id: &WorkerId) -> String {
        format!("fleetlease:worker:{id}")
    }

    pub fn worker_pattern() -> &'static str {
        "fleetlease:worker:*"
    }

    pub fn system_stats() -> &'static str {
        "fleetlease:system_stats"
    }

    pub fn worker_samples(id: &WorkerId) -> String {
        format!("fleetlease:perf:worker:{id}")
    }

    pub fn fleet_samples() -> &'static str {
        "fleetlease:perf:all"
    }

    pub fn sample_pattern() -> &'static str {
        "fleetlease:perf:*"
    }
}

mod scripts {
    use redis::Script;

    /// Sets the given hash fields and refreshes the TTL, only while the
    /// record exists. ARGV[1] is the TTL, the rest are field/value pairs.
    pub fn update_existing() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[1], unpack(ARGV, 2))
            redis.call('EXPIRE', KEYS[1], ARGV[1])
            return 1
            "#,
        )
    }
}

/// Worker records are hashes with one JSON-encoded value per field, so a
/// partial update touches only its own fields.
fn record_fields(record: &WorkerTelemetry) -> Result<Vec<(String, String)>> {
    let Value::Object(map) = serde_json::to_value(record)? else {
        return Err(CoreError::Telemetry("worker record is not an object".into()));
    };
    map.into_iter()
        .map(|(field, value)| Ok((field, serde_json::to_string(&value)?)))
        .collect()
}

fn update_fields(update: &WorkerUpdate, now: DateTime<Utc>) -> Result<Vec<(&'static str, String)>> {
    let mut fields = Vec::new();
    if let Some(status) = update.status {
        fields.push(("status", serde_json::to_string(&status)?));
    }
    if let Some(at) = update.last_heartbeat {
        fields.push(("last_heartbeat", serde_json::to_string(&at)?));
    }
    if let Some(processed) = update.processed {
        fields.push(("processed", processed.to_string()));
    }
    if let Some(success) = update.success {
        fields.push(("success", success.to_string()));
    }
    if let Some(failure) = update.failure {
        fields.push(("failure", failure.to_string()));
    }
    if let Some(batch) = &update.current_batch {
        fields.push(("current_batch", serde_json::to_string(batch)?));
    }
    fields.push(("updated_at", serde_json::to_string(&now)?));
    Ok(fields)
}

/// `None` for a missing (empty) hash.
fn decode_record(fields: HashMap<String, String>) -> Result<Option<WorkerTelemetry>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut map = Map::with_capacity(fields.len());
    for (field, raw) in fields {
        map.insert(field, serde_json::from_str(&raw)?);
    }
    Ok(Some(serde_json::from_value(Value::Object(map))?))
}

#[derive(Clone)]
pub struct RedisTelemetryStore {
    conn: ConnectionManager,
    config: TelemetryConfig,
}

impl fmt::Debug for RedisTelemetryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTelemetryStore")
            .field("connection", &"ConnectionManager")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisTelemetryStore {
    pub async fn connect(redis_url: &str, config: TelemetryConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            CoreError::Telemetry(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            CoreError::Telemetry(format!("Failed to connect to Redis: {e}"))
        })?;
        info!("Telemetry store connected to Redis");
        Ok(Self { conn, config })
    }

    /// Replaces the whole record and starts its TTL.
    async fn write_worker(&self, record: &WorkerTelemetry) -> Result<()> {
        let key = TelemetryKeys::worker(&record.worker_id);
        let fields = record_fields(record)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ttl(self.config.worker_ttl_secs))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis HSET failed: {e}")))
    }

    /// Reads list entries `0..=stop`; `-1` reads the whole list.
    async fn read_samples(&self, key: &str, stop: isize) -> Result<Vec<PerformanceSample>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(key, 0, stop)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis LRANGE failed: {e}")))?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(CoreError::from))
            .collect()
    }
}

fn ttl(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl TelemetryStore for RedisTelemetryStore {
    async fn register_worker(&self, record: WorkerTelemetry) -> Result<()> {
        debug!(worker_id = %record.worker_id, "telemetry register");
        self.write_worker(&record).await
    }

    async fn unregister_worker(&self, worker: &WorkerId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(TelemetryKeys::worker(worker))
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis DEL failed: {e}")))
    }

    async fn update_worker(&self, worker: &WorkerId, update: WorkerUpdate) -> Result<()> {
        let fields = update_fields(&update, Utc::now())?;
        let script = scripts::update_existing();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(TelemetryKeys::worker(worker))
            .arg(ttl(self.config.worker_ttl_secs));
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }
        let mut conn = self.conn.clone();
        let updated: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis worker update failed: {e}")))?;
        if updated == 0 {
            debug!(worker_id = %worker, "telemetry update for expired worker record skipped");
        }
        Ok(())
    }

    async fn increment_global_counters(&self, success: u64, failure: u64) -> Result<()> {
        let key = TelemetryKeys::system_stats();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hincr(key, "total_checked", success + failure)
            .ignore()
            .hincr(key, "total_success", success)
            .ignore()
            .hincr(key, "total_failure", failure)
            .ignore()
            .expire(key, ttl(self.config.counters_ttl_secs))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis HINCRBY failed: {e}")))
    }

    async fn global_counters(&self) -> Result<GlobalCounters> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, u64> = conn
            .hgetall(TelemetryKeys::system_stats())
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis HGETALL failed: {e}")))?;
        let field = |name: &str| fields.get(name).copied().unwrap_or(0);
        Ok(GlobalCounters {
            total_checked: field("total_checked"),
            total_success: field("total_success"),
            total_failure: field("total_failure"),
        })
    }

    async fn append_performance_sample(&self, sample: PerformanceSample) -> Result<()> {
        let json = serde_json::to_string(&sample)?;
        let stop = isize::try_from(self.config.sample_capacity)
            .unwrap_or(isize::MAX)
            .saturating_sub(1);
        let sample_ttl = ttl(self.config.sample_ttl_secs);
        let worker_key = TelemetryKeys::worker_samples(&sample.worker_id);
        let fleet_key = TelemetryKeys::fleet_samples();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(&worker_key, &json)
            .ignore()
            .ltrim(&worker_key, 0, stop)
            .ignore()
            .expire(&worker_key, sample_ttl)
            .ignore()
            .lpush(fleet_key, &json)
            .ignore()
            .ltrim(fleet_key, 0, stop)
            .ignore()
            .expire(fleet_key, sample_ttl)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis LPUSH failed: {e}")))
    }

    async fn performance_samples(
        &self,
        worker: Option<&WorkerId>,
        limit: usize,
    ) -> Result<Vec<PerformanceSample>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        match worker {
            Some(id) => self.read_samples(&TelemetryKeys::worker_samples(id), stop).await,
            None => self.read_samples(TelemetryKeys::fleet_samples(), stop).await,
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerTelemetry>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(TelemetryKeys::worker_pattern())
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis KEYS failed: {e}")))?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let values: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis HGETALL failed: {e}")))?;

        let mut workers = Vec::with_capacity(values.len());
        // Keys can expire between KEYS and HGETALL.
        for fields in values {
            if let Some(record) = decode_record(fields)? {
                workers.push(record);
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn cleanup_older_than(&self, age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - age;
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(TelemetryKeys::sample_pattern())
            .await
            .map_err(|e| CoreError::Telemetry(format!("Redis KEYS failed: {e}")))?;

        let mut removed = 0u64;
        for key in keys {
            let samples = self.read_samples(&key, -1).await?;
            // Lists are newest first, so everything from the first stale
            // sample onward is stale too.
            let Some(first_stale) = samples.iter().position(|s| s.recorded_at < cutoff) else {
                continue;
            };
            removed += (samples.len() - first_stale) as u64;
            if first_stale == 0 {
                conn.del::<_, ()>(&key)
                    .await
                    .map_err(|e| CoreError::Telemetry(format!("Redis DEL failed: {e}")))?;
            } else {
                let stop = isize::try_from(first_stale).unwrap_or(isize::MAX) - 1;
                conn.ltrim::<_, ()>(&key, 0, stop)
                    .await
                    .map_err(|e| CoreError::Telemetry(format!("Redis LTRIM failed: {e}")))?;
            }
        }
        if removed > 0 {
            info!(removed, "telemetry cleanup dropped old samples");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchId, WorkerStatus};

    fn stored(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn partial_update_only_names_its_own_fields() {
        let now = Utc::now();
        let heartbeat = WorkerUpdate {
            last_heartbeat: Some(now),
            ..WorkerUpdate::default()
        };
        let names: Vec<&str> = update_fields(&heartbeat, now)
            .expect("encodes")
            .into_iter()
            .map(|(field, _)| field)
            .collect();
        assert_eq!(names, vec!["last_heartbeat", "updated_at"]);
    }

    #[test]
    fn hash_fields_decode_with_overlaid_updates() {
        let now = Utc::now();
        let record = WorkerTelemetry {
            worker_id: WorkerId::from("w1"),
            status: WorkerStatus::Idle,
            batch_size: 2,
            connected_at: now,
            last_heartbeat: now,
            processed: 0,
            success: 0,
            failure: 0,
            current_batch: None,
            updated_at: now,
        };
        let mut fields = stored(record_fields(&record).expect("encodes"));

        // Two writers landing on the same hash keep each other's fields.
        let assignment = WorkerUpdate {
            status: Some(WorkerStatus::Working),
            current_batch: Some(Some(BatchId::from("b1"))),
            ..WorkerUpdate::default()
        };
        let heartbeat = WorkerUpdate {
            last_heartbeat: Some(now + chrono::TimeDelta::seconds(30)),
            ..WorkerUpdate::default()
        };
        for update in [assignment, heartbeat] {
            for (field, value) in update_fields(&update, now).expect("encodes") {
                fields.insert(field.to_string(), value);
            }
        }

        let decoded = decode_record(fields).expect("decodes").expect("present");
        assert_eq!(decoded.status, WorkerStatus::Working);
        assert_eq!(decoded.current_batch, Some(BatchId::from("b1")));
        assert_eq!(decoded.last_heartbeat, now + chrono::TimeDelta::seconds(30));
        assert!(decode_record(HashMap::new()).expect("decodes").is_none());
    }
}
