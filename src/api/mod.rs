// API module - HTTP endpoints

use axum::{routing::get, Router};

pub mod admin;
pub mod health;
pub mod license;
pub mod middleware;
pub mod state;

pub use state::AppState;

/// Every route the service exposes, bound to `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(license::router())
        .merge(admin::router(state.clone()))
        .with_state(state)
}
