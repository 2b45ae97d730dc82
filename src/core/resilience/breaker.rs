//! Per-service circuit breaker state shared across all sessions.
//!
//! One registry instance is created at startup and injected (via `Arc`) into
//! every client that talks to a downstream service. While a service's
//! breaker is open, calls are short-circuited without touching the network.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::transport::ServiceName;

/// Breaker policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long a tripped breaker stays open.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Fast-fail error returned while a breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {service}, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub service: ServiceName,
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Registry of breaker state, one entry per downstream service, created
/// lazily on first use. All transitions are atomic read-modify-write under
/// the registry lock because many session tasks share one registry.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    states: Mutex<HashMap<ServiceName, BreakerState>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call: `Err(CircuitOpen)` while `now < open_until`.
    ///
    /// An elapsed cooldown clears `open_until` so the next call probes the
    /// service again (its failure count starts from the tripping value and
    /// one success resets it fully).
    pub fn check(&self, service: ServiceName) -> Result<(), CircuitOpen> {
        let mut states = self.states.lock();
        let state = states.entry(service).or_default();

        if let Some(open_until) = state.open_until {
            let now = Instant::now();
            if now < open_until {
                return Err(CircuitOpen {
                    service,
                    retry_after: open_until - now,
                });
            }
            info!(service = %service, "breaker cooldown elapsed, allowing probe");
            state.open_until = None;
        }
        Ok(())
    }

    /// Record a failed attempt. Returns `true` when this failure tripped
    /// the breaker (callers stop retrying immediately on a trip).
    pub fn record_failure(&self, service: ServiceName) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(service).or_default();

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold && state.open_until.is_none()
        {
            state.open_until = Some(Instant::now() + self.config.cooldown);
            warn!(
                service = %service,
                failures = state.consecutive_failures,
                cooldown = ?self.config.cooldown,
                "circuit breaker tripped"
            );
            return true;
        }
        false
    }

    /// Record a successful attempt: the service is healthy again.
    pub fn record_success(&self, service: ServiceName) {
        let mut states = self.states.lock();
        let state = states.entry(service).or_default();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Current consecutive-failure count, for logging and tests.
    pub fn failure_count(&self, service: ServiceName) -> u32 {
        self.states
            .lock()
            .get(&service)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Whether the named service is currently open.
    pub fn is_open(&self, service: ServiceName) -> bool {
        self.states
            .lock()
            .get(&service)
            .and_then(|s| s.open_until)
            .is_some_and(|until| Instant::now() < until)
    }
}
