//! HTTP and websocket handlers

pub mod handle_websocket;
pub mod health;

pub use handle_websocket::websocket_handler;
pub use health::health_handler;
