use serde::{Deserialize, Serialize};

/// Lease tuning for account checkout.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// A processing account whose lease is older than this is eligible for
    /// checkout again (seconds).
    pub lease_duration_secs: i64,
    /// Completed accounts older than this are deleted by retention (days).
    pub retention_days: i64,
    /// Upper bound on accounts handed out by one checkout.
    pub max_checkout: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 600,
            retention_days: 30,
            max_checkout: 100,
        }
    }
}

impl LeaseConfig {
    pub fn lease_duration(&self) -> chrono::Duration {
        crate::span::signed_secs(self.lease_duration_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        crate::span::days(self.retention_days)
    }
}
