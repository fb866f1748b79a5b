use std::{fmt, sync::Arc};

use fleetlease_core::{Coordinator, ProxyRefresher};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub coordinator: Arc<Coordinator>,
    /// Present only when a proxy source is configured.
    pub refresher: Option<Arc<ProxyRefresher>>,
    /// Present only when running against PostgreSQL.
    pub postgres: Option<PgPool>,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("connections", &self.coordinator.connection_count())
            .field("refresher", &self.refresher.is_some())
            .field("postgres", &self.postgres.is_some())
            .finish_non_exhaustive()
    }
}
