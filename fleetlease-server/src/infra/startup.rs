//! Wires stores, the coordinator and background tasks from a [`Config`].

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use fleetlease_core::{
    Coordinator, CoordinatorDeps, LeaseManager, ProxyPool, ProxyRefresher, TelemetryStore,
    coordinator::maintenance,
    leasing::{InMemoryAccountRepository, PostgresAccountRepository},
    proxy_pool::{InMemoryProxyRepository, PostgresProxyRepository},
    telemetry::{InMemoryTelemetryStore, RedisTelemetryStore},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::infra::{app_state::AppState, config::Config, proxy_source::HttpProxySource};

/// Running application: shared state plus the background tasks bound to
/// `shutdown`.
#[derive(Debug)]
pub struct Bootstrap {
    pub state: AppState,
    pub shutdown: CancellationToken,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Bootstrap {
    /// Cancels background work and waits for it to wind down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}

pub async fn connect_postgres(config: &Config) -> Result<Option<PgPool>> {
    let Some(url) = config.database.url.as_deref() else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    info!(
        max_connections = config.database.max_connections,
        "Successfully connected to PostgreSQL"
    );
    Ok(Some(pool))
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    fleetlease_core::MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied");
    Ok(())
}

async fn connect_telemetry(config: &Config) -> Result<Arc<dyn TelemetryStore>> {
    match &config.redis {
        Some(redis) => {
            let store = RedisTelemetryStore::connect(&redis.url, config.telemetry)
                .await
                .context("failed to connect telemetry store")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Telemetry kept in process memory");
            Ok(Arc::new(InMemoryTelemetryStore::new(config.telemetry)))
        }
    }
}

/// Builds every component and spawns maintenance and proxy refresh.
pub async fn bootstrap(config: Arc<Config>) -> Result<Bootstrap> {
    let postgres = connect_postgres(&config).await?;
    if let Some(pool) = &postgres {
        if config.database.run_migrations {
            run_migrations(pool).await?;
        } else {
            info!("Skipping migrations (disabled by configuration)");
        }
    }

    let (accounts, proxies): (
        Arc<dyn fleetlease_core::AccountRepository>,
        Arc<dyn fleetlease_core::ProxyRepository>,
    ) = match &postgres {
        Some(pool) => (
            Arc::new(PostgresAccountRepository::new(pool.clone())),
            Arc::new(PostgresProxyRepository::new(pool.clone())),
        ),
        None => {
            warn!("Running without PostgreSQL; queue state is lost on restart");
            (
                Arc::new(InMemoryAccountRepository::new()),
                Arc::new(InMemoryProxyRepository::new()),
            )
        }
    };

    let telemetry = connect_telemetry(&config).await?;
    let proxy_pool = Arc::new(ProxyPool::new(proxies));
    let deps = CoordinatorDeps {
        leases: LeaseManager::new(accounts, config.leasing),
        proxies: proxy_pool.clone(),
        telemetry,
    };
    let coordinator = Coordinator::new(deps, config.coordinator);

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(maintenance::run(
        coordinator.clone(),
        config.telemetry,
        shutdown.child_token(),
    )));

    let refresher = match &config.proxy_source.url {
        Some(url) => {
            let source = HttpProxySource::new(
                url.clone(),
                Duration::from_secs(config.proxy_source.request_timeout_secs),
            )?;
            let refresher = Arc::new(ProxyRefresher::new(
                proxy_pool,
                Arc::new(source),
                config.refresh,
            ));
            info!(
                source = %refresher.status().source,
                interval_secs = config.refresh.interval_secs,
                "Proxy refresh scheduled"
            );
            tasks.push(tokio::spawn(refresher.clone().run(shutdown.child_token())));
            Some(refresher)
        }
        None => None,
    };

    let state = AppState {
        config,
        coordinator,
        refresher,
        postgres,
        shutdown: shutdown.clone(),
    };

    Ok(Bootstrap {
        state,
        shutdown,
        tasks,
    })
}
