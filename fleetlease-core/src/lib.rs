//! # fleetlease core
//!
//! Coordination core for a fleet of remote workers that check accounts
//! through single-use proxies.
//!
//! ## Overview
//!
//! - **Leasing**: accounts are grouped into batches and handed out under
//!   time-bounded leases. A lease expires on its own, so a crashed worker
//!   never strands work.
//! - **Proxy pool**: every proxy is consumed by exactly one assignment and
//!   the pool is wholesale-replaced by a scheduled refresh.
//! - **Telemetry**: worker liveness and performance samples with TTLs.
//! - **Coordinator**: per-connection state machine over a JSON protocol.
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL stores via SQLx
//! - `redis-telemetry`: Redis telemetry store
//! - `postgres-tests`: integration tests that need a live database

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Worker connection handling and assignment flow
pub mod coordinator;

/// Error types
pub mod error;

/// Account and batch leasing
pub mod leasing;

/// Single-use proxy pool and its refresh schedule
pub mod proxy_pool;

/// Clamped time spans for configured windows
pub mod span;

/// Liveness and performance bookkeeping
pub mod telemetry;

/// Domain records shared by every component
pub mod types;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorDeps};
pub use error::{CoreError, Result};
pub use leasing::{AccountRepository, LeaseConfig, LeaseManager};
pub use proxy_pool::{ProxyPool, ProxyRefresher, ProxyRepository, ProxySource};
pub use telemetry::{TelemetryConfig, TelemetryStore};
