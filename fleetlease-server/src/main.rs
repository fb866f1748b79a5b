//! # fleetlease server
//!
//! Coordinates a fleet of remote account-checking workers over websockets.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - PostgreSQL for the account queue and the proxy pool (in-memory fallback)
//! - Redis for worker telemetry (in-memory fallback)
//! - A plain-text HTTP proxy list as the refresh source

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use fleetlease_server::{
    infra::{
        config::{Config, ConfigLoad, ConfigLoader},
        startup::{bootstrap, connect_postgres, run_migrations},
    },
    routes::{WORKER_SOCKET_PATH, create_app},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "fleetlease-server")]
#[command(about = "Lease accounts and single-use proxies to a fleet of websocket workers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FLEETLEASE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Db(DbCommand::Migrate) => {
                run_db_migrate(&cli.serve).await?;
                return Ok(());
            }
        }
    }

    run_server(cli.serve).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    info!(
        heartbeat_timeout_secs = config.coordinator.heartbeat_timeout_secs,
        default_batch_size = config.coordinator.default_batch_size,
        lease_duration_secs = config.leasing.lease_duration_secs,
        refresh_interval_secs = config.refresh.interval_secs,
        "coordinator configuration in effect"
    );

    Ok(config)
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let pool = connect_postgres(&config)
        .await?
        .ok_or_else(|| anyhow!("DATABASE_URL must be set to run migrations"))?;
    run_migrations(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = Arc::new(load_runtime_config(&args)?);
    let bind = (config.server.host.clone(), config.server.port);

    let app = bootstrap(config).await?;
    let router = create_app(app.state.clone());

    let listener = tokio::net::TcpListener::bind((bind.0.as_str(), bind.1))
        .await
        .with_context(|| format!("failed to bind {}:{}", bind.0, bind.1))?;
    let addr = listener.local_addr()?;
    info!(%addr, socket = WORKER_SOCKET_PATH, "fleetlease server listening");

    // Open worker sockets watch the same token, so they wind down too.
    let shutdown = app.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    app.shutdown().await;
    info!("fleetlease server stopped");
    Ok(())
}
