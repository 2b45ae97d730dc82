//! HTTP and WebSocket request handlers
//!
//! - `api` - Interaction and health endpoints
//! - `ws` - WebSocket real-time voice sessions

pub mod api;
pub mod ws;

// Re-export commonly used handlers for convenient access
pub use ws::ws_session_handler;
