use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::{
    handlers::{health_handler, websocket_handler},
    infra::app_state::AppState,
};

/// Path workers connect to.
pub const WORKER_SOCKET_PATH: &str = "/instance-socket";

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(WORKER_SOCKET_PATH, get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
