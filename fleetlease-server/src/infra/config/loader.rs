use fleetlease_core::span::MAX_SPAN_SECS;
use once_cell::sync::Lazy;
use std::{fs, path::PathBuf};
use thiserror::Error;
use url::Url;

use super::{
    models::{
        Config, ConfigMetadata, ConfigWarnings, DatabaseConfig, ProxySourceConfig, RedisConfig,
        ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("fleetlease.toml"),
        PathBuf::from("config/fleetlease.toml"),
    ]
});

const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_PROXY_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env` (if any), then layers environment over file over defaults.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Same as [`ConfigLoader::load`] with a pre-gathered environment and no
    /// `.env` handling.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(file_config, env, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env.config_path {
            source.env = Some(from_env.clone());
        } else {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No fleetlease.toml detected; falling back to environment variables",
            "Set FLEETLEASE_CONFIG or pass --config to point at a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        proxy_source: file_proxy_source,
        mut coordinator,
        leasing,
        telemetry,
        mut refresh,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(3000),
    };

    let database_url = env
        .database_url
        .or(file_database.url)
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    if let Some(raw) = &database_url {
        validate_url(raw, &["postgres", "postgresql"], "database")?;
    } else {
        warnings.push_with_hint(
            "DATABASE_URL is not set; accounts and proxies live in memory only",
            "Point DATABASE_URL at PostgreSQL to persist the queue across restarts",
        );
    }
    let database = DatabaseConfig {
        url: database_url,
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1),
        run_migrations: env
            .run_migrations
            .or(file_database.run_migrations)
            .unwrap_or(true),
    };

    let redis = env
        .redis_url
        .or(file_redis.map(|r| r.url))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .map(|url| RedisConfig { url });
    if let Some(redis) = &redis {
        validate_url(&redis.url, &["redis", "rediss"], "redis")?;
    } else {
        warnings.push("REDIS_URL is not set; telemetry is kept in process memory");
    }

    let proxy_url = env
        .proxy_source_url
        .or(file_proxy_source.url)
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    if let Some(raw) = &proxy_url {
        validate_url(raw, &["http", "https"], "proxy source")?;
    } else {
        warnings.push_with_hint(
            "No proxy source configured; the proxy pool is never refreshed",
            "Set PROXY_SOURCE_URL to a plain-text proxy list",
        );
    }
    let proxy_source = ProxySourceConfig {
        url: proxy_url,
        request_timeout_secs: file_proxy_source
            .request_timeout_secs
            .unwrap_or(DEFAULT_PROXY_REQUEST_TIMEOUT_SECS),
    };

    if let Some(secs) = env.heartbeat_timeout_secs {
        coordinator.heartbeat_timeout_secs = secs;
    }
    if let Some(secs) = env.proxy_refresh_interval_secs {
        refresh.interval_secs = secs;
    }

    if coordinator.heartbeat_timeout_secs.saturating_mul(1_000) <= coordinator.heartbeat_interval_ms
    {
        warnings.push(format!(
            "heartbeat_timeout_secs ({}) does not exceed the advertised heartbeat interval ({} ms); \
             healthy workers will be evicted",
            coordinator.heartbeat_timeout_secs, coordinator.heartbeat_interval_ms
        ));
    }
    if leasing.lease_duration_secs <= 0 {
        return Err(ConfigLoadError::Invalid(
            "leasing.lease_duration_secs must be positive".into(),
        ));
    }
    if refresh.interval_secs == 0 {
        return Err(ConfigLoadError::Invalid(
            "refresh.interval_secs must be positive".into(),
        ));
    }
    let day_secs = |days: i64| u64::try_from(days).unwrap_or(0).saturating_mul(86_400);
    let windows = [
        ("coordinator.heartbeat_timeout_secs", coordinator.heartbeat_timeout_secs),
        (
            "leasing.lease_duration_secs",
            u64::try_from(leasing.lease_duration_secs).unwrap_or(0),
        ),
        ("leasing.retention_days", day_secs(leasing.retention_days)),
        ("telemetry.retention_days", day_secs(telemetry.retention_days)),
        ("telemetry.worker_ttl_secs", telemetry.worker_ttl_secs),
        ("refresh.interval_secs", refresh.interval_secs),
    ];
    for (name, secs) in windows {
        if secs > MAX_SPAN_SECS {
            return Err(ConfigLoadError::Invalid(format!(
                "{name} exceeds the supported maximum of {MAX_SPAN_SECS} seconds"
            )));
        }
    }

    let config = Config {
        server,
        database,
        redis,
        proxy_source,
        coordinator,
        leasing,
        telemetry,
        refresh,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
    };

    Ok((config, warnings))
}

fn validate_url(raw: &str, schemes: &[&str], what: &'static str) -> Result<(), ConfigLoadError> {
    let parsed = Url::parse(raw).map_err(|source| ConfigLoadError::InvalidUrl { what, source })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigLoadError::UnsupportedScheme {
            what,
            scheme: parsed.scheme().to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {what} URL")]
    InvalidUrl {
        what: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported {what} URL scheme '{scheme}'")]
    UnsupportedScheme { what: &'static str, scheme: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        self.default
            .as_ref()
            .map(|path| (path.clone(), ConfigPathProvenance::Default))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit | ConfigPathProvenance::Env)
    }
}
