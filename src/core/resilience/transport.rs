//! Transport seam for the four downstream services.
//!
//! The retry/breaker logic in [`super::client`] is written against the
//! [`ServiceTransport`] trait so it can be exercised with scripted mocks;
//! [`HttpTransport`] is the production implementation over `reqwest`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Names of the downstream services this orchestrator depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Stt,
    ContextLlm,
    ResponseLlm,
    Tts,
}

impl ServiceName {
    pub const ALL: [ServiceName; 4] = [
        ServiceName::Stt,
        ServiceName::ContextLlm,
        ServiceName::ResponseLlm,
        ServiceName::Tts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Stt => "stt",
            ServiceName::ContextLlm => "context_llm",
            ServiceName::ResponseLlm => "response_llm",
            ServiceName::Tts => "tts",
        }
    }

    /// Request path on the service's base URL.
    fn request_path(&self) -> &'static str {
        match self {
            ServiceName::Stt => "/speech-to-text",
            ServiceName::ContextLlm => "/generate-context",
            ServiceName::ResponseLlm => "/generate-response",
            ServiceName::Tts => "/text-to-speech",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed transport attempt. Timeouts count the same as transport
/// errors for breaker accounting.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// One attempt against a downstream service. Implementations perform no
/// retries of their own; that policy lives in the resilient client.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    /// JSON request/response call.
    async fn request(
        &self,
        service: ServiceName,
        payload: Value,
    ) -> Result<Value, TransportFailure>;

    /// Open a chunked audio stream (TTS). The returned receiver yields raw
    /// audio chunks; the feeding task stops when the receiver is dropped.
    async fn request_streaming(
        &self,
        service: ServiceName,
        payload: Value,
    ) -> Result<mpsc::Receiver<Bytes>, TransportFailure>;

    /// Liveness probe against the service's `/health` endpoint.
    async fn probe(&self, service: ServiceName) -> Result<(), TransportFailure>;
}

/// Timeout policy per call class.
#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    /// STT / context / response stages.
    pub stage: Duration,
    /// Streamed synthesis (longer: covers the whole stream).
    pub synthesis: Duration,
    /// Health probes.
    pub probe: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            stage: Duration::from_secs(10),
            synthesis: Duration::from_secs(60),
            probe: Duration::from_secs(2),
        }
    }
}

/// Production transport over `reqwest`, one base URL per service.
pub struct HttpTransport {
    client: reqwest::Client,
    base_urls: HashMap<ServiceName, String>,
    timeouts: TransportTimeouts,
}

impl HttpTransport {
    pub fn new(base_urls: HashMap<ServiceName, String>, timeouts: TransportTimeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_urls,
            timeouts,
        }
    }

    fn url(&self, service: ServiceName, path: &str) -> String {
        let base = self
            .base_urls
            .get(&service)
            .map(String::as_str)
            .unwrap_or_default();
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    fn map_error(err: reqwest::Error) -> TransportFailure {
        if err.is_timeout() {
            TransportFailure::Timeout
        } else {
            TransportFailure::Network(err.to_string())
        }
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportFailure> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportFailure::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn request(
        &self,
        service: ServiceName,
        payload: Value,
    ) -> Result<Value, TransportFailure> {
        let url = self.url(service, service.request_path());
        debug!(service = %service, %url, "downstream request");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeouts.stage)
            .json(&payload)
            .send()
            .await
            .map_err(Self::map_error)?;

        let response = Self::check_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportFailure::Network(format!("invalid JSON body: {e}")))
    }

    async fn request_streaming(
        &self,
        service: ServiceName,
        payload: Value,
    ) -> Result<mpsc::Receiver<Bytes>, TransportFailure> {
        let url = self.url(service, "/stream-text-to-speech");
        debug!(service = %service, %url, "downstream streaming request");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeouts.synthesis)
            .json(&payload)
            .send()
            .await
            .map_err(Self::map_error)?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel::<Bytes>(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            // Receiver dropped: playback was cancelled.
                            break;
                        }
                    }
                    Err(e) => {
                        error!(service = %service, "synthesis stream aborted: {e}");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn probe(&self, service: ServiceName) -> Result<(), TransportFailure> {
        let url = self.url(service, "/health");
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.probe)
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check_status(response).await.map(|_| ())
    }
}
