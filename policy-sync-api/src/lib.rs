//! Policy Sync API Server
//!
//! HTTP surface and process wiring for the dbt policy reconciliation engine.

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;

pub use config::{ConfigError, SyncConfig};
pub use error::ApiError;
pub use handlers::{SyncRequest, SyncResponse};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/sync", post(handlers::sync))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
