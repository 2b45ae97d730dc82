//! Router composition.

pub mod api;
pub mod ws;
