use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::infra::{app_state::AppState, errors::AppResult};

/// Liveness plus PostgreSQL reachability. An unreachable database answers
/// 503 through [`AppError`](crate::infra::errors::AppError).
pub async fn health_handler(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let database = match &state.postgres {
        Some(pool) => {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(pool)
                .await?;
            "healthy"
        }
        None => "in_memory",
    };

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "database": database,
            "telemetry": if state.config.redis.is_some() { "redis" } else { "in_memory" },
            "connections": state.coordinator.connection_count(),
            "proxy_refresh": state.refresher.as_ref().map(|r| r.status()),
        }
    })))
}
