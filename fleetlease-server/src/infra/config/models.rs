use std::path::PathBuf;

use fleetlease_core::coordinator::CoordinatorConfig;
use fleetlease_core::leasing::LeaseConfig;
use fleetlease_core::proxy_pool::RefreshConfig;
use fleetlease_core::telemetry::TelemetryConfig;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub proxy_source: ProxySourceConfig,
    pub coordinator: CoordinatorConfig,
    pub leasing: LeaseConfig,
    pub telemetry: TelemetryConfig,
    pub refresh: RefreshConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Without a URL the server runs on in-memory stores.
    pub url: Option<String>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProxySourceConfig {
    /// Plain-text list endpoint, one proxy per line.
    pub url: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
