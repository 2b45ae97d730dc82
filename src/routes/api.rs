use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// REST routes: one-shot interaction plus the aggregated health check.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/interact", post(api::interact))
        .route("/health", get(api::health_check))
}
