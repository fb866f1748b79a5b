//! Scheduled proxy pool refresh.
//!
//! A refresh walks `idle -> updating -> {succeeded, failed}`. Only one
//! refresh runs at a time; a second trigger while one is in flight is
//! rejected with [`CoreError::RefreshInProgress`]. Observers can poll
//! [`ProxyRefresher::status`] or subscribe to [`RefreshEvent`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ProxyPool;
use crate::error::{CoreError, Result};
use crate::types::ProxyCandidate;

/// Opaque supplier of proxy candidates.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Human-readable description, safe to log.
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<ProxyCandidate>>;
}

/// Fixed candidate list.
#[derive(Clone, Debug, Default)]
pub struct StaticProxySource {
    candidates: Vec<ProxyCandidate>,
}

impl StaticProxySource {
    pub fn new(candidates: Vec<ProxyCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    fn describe(&self) -> String {
        format!("static list ({} entries)", self.candidates.len())
    }

    async fn fetch(&self) -> Result<Vec<ProxyCandidate>> {
        Ok(self.candidates.clone())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between scheduled refreshes.
    pub interval_secs: u64,
    /// Upper bound for one fetch from the source (seconds).
    pub fetch_timeout_secs: u64,
    /// Refresh once immediately when the schedule starts.
    pub refresh_on_start: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1_800,
            fetch_timeout_secs: 300,
            refresh_on_start: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    #[default]
    Idle,
    Updating,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub phase: RefreshPhase,
    pub source: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_inserted: Option<u64>,
    pub last_error: Option<String>,
    pub next_update_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefreshEvent {
    UpdateStarted { at: DateTime<Utc> },
    UpdateCompleted { inserted: u64, at: DateTime<Utc> },
    UpdateFailed { error: String, at: DateTime<Utc> },
}

/// Masks everything past the host of a URL-like source description.
pub fn mask_source(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or(authority);
    if authority.len() == rest.len() {
        format!("{scheme}://{host}")
    } else {
        format!("{scheme}://{host}/***")
    }
}

pub struct ProxyRefresher {
    pool: Arc<ProxyPool>,
    source: Arc<dyn ProxySource>,
    config: RefreshConfig,
    status: Mutex<RefreshStatus>,
    in_flight: tokio::sync::Mutex<()>,
    events: broadcast::Sender<RefreshEvent>,
}

impl fmt::Debug for ProxyRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRefresher")
            .field("config", &self.config)
            .field("phase", &self.status.lock().phase)
            .finish()
    }
}

impl ProxyRefresher {
    pub fn new(
        pool: Arc<ProxyPool>,
        source: Arc<dyn ProxySource>,
        config: RefreshConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        let status = RefreshStatus {
            source: mask_source(&source.describe()),
            ..RefreshStatus::default()
        };
        Self {
            pool,
            source,
            config,
            status: Mutex::new(status),
            in_flight: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn status(&self) -> RefreshStatus {
        self.status.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RefreshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fetches from the source and replaces the pool. Rejected while another
    /// refresh is running.
    pub async fn refresh_now(&self) -> Result<u64> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("proxy refresh already in progress; trigger ignored");
            return Err(CoreError::RefreshInProgress);
        };

        let started = Utc::now();
        {
            let mut status = self.status.lock();
            status.phase = RefreshPhase::Updating;
            status.last_started_at = Some(started);
        }
        self.emit(RefreshEvent::UpdateStarted { at: started });
        info!("proxy refresh started");

        let outcome = self.fetch_and_replace().await;
        let finished = Utc::now();
        let mut status = self.status.lock();
        status.last_finished_at = Some(finished);
        match &outcome {
            Ok(inserted) => {
                status.phase = RefreshPhase::Succeeded;
                status.last_inserted = Some(*inserted);
                status.last_error = None;
                drop(status);
                info!(inserted, "proxy refresh completed");
                self.emit(RefreshEvent::UpdateCompleted {
                    inserted: *inserted,
                    at: finished,
                });
            }
            Err(err) => {
                status.phase = RefreshPhase::Failed;
                status.last_error = Some(err.to_string());
                drop(status);
                error!(error = %err, "proxy refresh failed; pool left unchanged");
                self.emit(RefreshEvent::UpdateFailed {
                    error: err.to_string(),
                    at: finished,
                });
            }
        }
        outcome
    }

    async fn fetch_and_replace(&self) -> Result<u64> {
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
        let candidates = tokio::time::timeout(timeout, self.source.fetch())
            .await
            .map_err(|_| {
                CoreError::ProxySource(format!(
                    "fetch timed out after {}s",
                    self.config.fetch_timeout_secs
                ))
            })??;
        let source = self.status.lock().source.clone();
        self.pool.replace_all(candidates, &source).await
    }

    /// Runs scheduled refreshes until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        if !self.config.refresh_on_start {
            interval.tick().await;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Failures are already recorded in the status and event stream.
            let _ = self.refresh_now().await;
            let next = Utc::now() + crate::span::secs(self.config.interval_secs);
            self.status.lock().next_update_at = Some(next);
        }
        info!("proxy refresh schedule stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_path_and_credentials() {
        assert_eq!(
            mask_source("https://user:pw@lists.example.com/api/v1?key=secret"),
            "https://lists.example.com/***"
        );
        assert_eq!(mask_source("http://host"), "http://host");
        assert_eq!(mask_source("static list (3 entries)"), "static list (3 entries)");
    }
}
