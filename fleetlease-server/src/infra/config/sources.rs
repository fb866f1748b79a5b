use std::path::PathBuf;

use fleetlease_core::coordinator::CoordinatorConfig;
use fleetlease_core::leasing::LeaseConfig;
use fleetlease_core::proxy_pool::RefreshConfig;
use fleetlease_core::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub proxy_source: FileProxySourceConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub leasing: LeaseConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_migrations: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileProxySourceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub run_migrations: Option<bool>,
    pub redis_url: Option<String>,
    pub proxy_source_url: Option<String>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub proxy_refresh_interval_secs: Option<u64>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the overlay from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        fn parse_trimmed<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|raw| raw.trim().parse().ok())
        }

        Self {
            config_path: non_empty("FLEETLEASE_CONFIG").map(PathBuf::from),
            server_host: non_empty("SERVER_HOST"),
            server_port: parse_trimmed(non_empty("SERVER_PORT")),
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: parse_trimmed(non_empty("DATABASE_MAX_CONNECTIONS")),
            run_migrations: non_empty("RUN_MIGRATIONS").and_then(|raw| parse_bool(&raw)),
            redis_url: non_empty("REDIS_URL"),
            proxy_source_url: non_empty("PROXY_SOURCE_URL"),
            heartbeat_timeout_secs: parse_trimmed(non_empty("HEARTBEAT_TIMEOUT_SECS")),
            proxy_refresh_interval_secs: parse_trimmed(non_empty("PROXY_REFRESH_INTERVAL_SECS")),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
