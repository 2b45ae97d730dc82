use axum::{Router, routing::get};

use crate::handlers::ws;
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router.
///
/// The `/ws` endpoint is intentionally unauthenticated: sessions are
/// short-lived, audio is ephemeral, and the service acts as a processing
/// pipeline rather than a data store. Put a reverse proxy in front if the
/// deployment needs access control.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws::ws_session_handler))
}
