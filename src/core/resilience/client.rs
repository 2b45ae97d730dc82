//! Retrying, breaker-aware wrapper around the downstream transport.
//!
//! Every downstream call in the system goes through [`ResilientClient`], so
//! this is the single chokepoint for retry, backoff and circuit-breaker
//! policy. The client is cheap to clone and safe to share across all
//! concurrent session tasks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::breaker::BreakerRegistry;
use super::transport::{ServiceName, ServiceTransport, TransportFailure};

/// Retry/backoff policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per logical call (not counting breaker fast-fails).
    pub max_retries: u32,
    /// Base of the exponential backoff.
    pub backoff_base: Duration,
    /// Cap on a single backoff wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt + random(0, 1s)`, capped at `max_backoff`.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
        (exp + jitter).min(self.max_backoff)
    }
}

/// Result of a JSON call. Never panics, never raises to the caller: a
/// breaker fast-fail and an exhausted retry budget are both ordinary values
/// callers must treat as soft failures.
#[derive(Debug)]
pub enum CallOutcome {
    Success(Value),
    /// Breaker was open; no network attempt was made.
    CircuitOpen { retry_after: Duration },
    /// All retries failed without tripping the breaker mid-call, or the
    /// breaker tripped partway through the budget.
    Fallback { error_details: String },
}

/// Result of a streaming call.
#[derive(Debug)]
pub enum StreamOutcome {
    Stream(mpsc::Receiver<Bytes>),
    CircuitOpen { retry_after: Duration },
    Fallback { error_details: String },
}

/// Shared downstream client: retries with exponential backoff and jitter,
/// consults the breaker registry before and during every call.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn ServiceTransport>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn ServiceTransport>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            breakers,
            retry,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn transport(&self) -> &Arc<dyn ServiceTransport> {
        &self.transport
    }

    /// JSON request/response call with full resilience policy applied.
    pub async fn call(&self, service: ServiceName, payload: Value) -> CallOutcome {
        if let Err(open) = self.breakers.check(service) {
            debug!(service = %service, retry_after = ?open.retry_after, "fast-fail: breaker open");
            return CallOutcome::CircuitOpen {
                retry_after: open.retry_after,
            };
        }

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_retries {
            match self.transport.request(service, payload.clone()).await {
                Ok(value) => {
                    self.breakers.record_success(service);
                    return CallOutcome::Success(value);
                }
                Err(failure) => {
                    last_error = failure.to_string();
                    warn!(
                        service = %service,
                        attempt = attempt + 1,
                        max = self.retry.max_retries,
                        "downstream call failed: {last_error}"
                    );
                    if self.breakers.record_failure(service) {
                        // Breaker tripped: burn no more of the retry budget.
                        return CallOutcome::Fallback {
                            error_details: format!(
                                "{service} circuit opened after repeated failures: {last_error}"
                            ),
                        };
                    }
                }
            }

            if attempt + 1 < self.retry.max_retries {
                tokio::time::sleep(self.retry.backoff_for(attempt)).await;
            }
        }

        CallOutcome::Fallback {
            error_details: format!(
                "{service} failed after {} attempts: {last_error}",
                self.retry.max_retries
            ),
        }
    }

    /// Streaming call (synthesis). On success the returned receiver yields
    /// audio chunks until the stream ends or `cancel` fires; cancellation
    /// stops forwarding within one chunk.
    pub async fn call_streaming(
        &self,
        service: ServiceName,
        payload: Value,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        if let Err(open) = self.breakers.check(service) {
            debug!(service = %service, retry_after = ?open.retry_after, "fast-fail: breaker open");
            return StreamOutcome::CircuitOpen {
                retry_after: open.retry_after,
            };
        }

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_retries {
            match self.transport.request_streaming(service, payload.clone()).await {
                Ok(upstream) => {
                    self.breakers.record_success(service);
                    return StreamOutcome::Stream(Self::cancellable(upstream, cancel));
                }
                Err(failure) => {
                    last_error = failure.to_string();
                    warn!(
                        service = %service,
                        attempt = attempt + 1,
                        max = self.retry.max_retries,
                        "downstream streaming call failed: {last_error}"
                    );
                    if self.breakers.record_failure(service) {
                        return StreamOutcome::Fallback {
                            error_details: format!(
                                "{service} circuit opened after repeated failures: {last_error}"
                            ),
                        };
                    }
                }
            }

            if attempt + 1 < self.retry.max_retries {
                tokio::time::sleep(self.retry.backoff_for(attempt)).await;
            }
        }

        StreamOutcome::Fallback {
            error_details: format!(
                "{service} failed after {} attempts: {last_error}",
                self.retry.max_retries
            ),
        }
    }

    /// Bridge an upstream chunk stream through a channel that honors the
    /// per-invocation cancel token. Dropping the returned receiver also
    /// stops the bridge.
    fn cancellable(
        mut upstream: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = upstream.recv() => match chunk {
                        Some(bytes) => {
                            if tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        rx
    }

    /// Health snapshot across all downstream services, probed through the
    /// transport without retry (a health check should be cheap and honest).
    pub async fn probe_all(&self) -> Vec<(ServiceName, Result<(), TransportFailure>)> {
        let mut results = Vec::with_capacity(ServiceName::ALL.len());
        for service in ServiceName::ALL {
            results.push((service, self.transport.probe(service).await));
        }
        results
    }
}
