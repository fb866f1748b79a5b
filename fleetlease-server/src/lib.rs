//! # fleetlease server
//!
//! Websocket front end for the fleetlease coordinator: configuration,
//! store wiring, the worker socket and a health probe.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
