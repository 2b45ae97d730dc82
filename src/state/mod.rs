use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::pipeline::Orchestrator;
use crate::core::resilience::breaker::BreakerRegistry;
use crate::core::resilience::client::ResilientClient;
use crate::core::resilience::transport::{HttpTransport, ServiceTransport};
use crate::core::segmenter::SegmenterConfig;
use crate::core::session::SessionStore;
use crate::core::vad::VadDetector;

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub orchestrator: Orchestrator,
    pub sessions: SessionStore,
    pub vad: VadDetector,
    pub segmenter_config: SegmenterConfig,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let transport: Arc<dyn ServiceTransport> = Arc::new(HttpTransport::new(
            config.base_urls(),
            config.transport_timeouts(),
        ));
        Self::with_transport(config, transport)
    }

    /// Builds the state around an arbitrary transport. Tests use this to
    /// drive the full stack against scripted downstream services.
    pub fn with_transport(config: ServerConfig, transport: Arc<dyn ServiceTransport>) -> Arc<Self> {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
        let client = ResilientClient::new(transport, breakers, config.retry_policy());
        let orchestrator = Orchestrator::new(client, config.pipeline_config());
        let sessions = SessionStore::in_memory(10_000, config.session_ttl());
        let vad = VadDetector::new(config.vad_config());
        let segmenter_config = config.segmenter_config();

        Arc::new(Self {
            config,
            orchestrator,
            sessions,
            vad,
            segmenter_config,
        })
    }
}
