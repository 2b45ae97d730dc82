//! Resilience layer shared by every downstream call: per-service circuit
//! breakers, the retrying client, and the transport seam behind it.

pub mod breaker;
pub mod client;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitOpen};
pub use client::{CallOutcome, ResilientClient, RetryPolicy, StreamOutcome};
pub use transport::{HttpTransport, ServiceName, ServiceTransport, TransportFailure};
