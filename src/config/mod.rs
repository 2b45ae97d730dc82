//! Server configuration, loaded from the environment.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::core::pipeline::PipelineConfig;
use crate::core::resilience::breaker::BreakerConfig;
use crate::core::resilience::client::RetryPolicy;
use crate::core::resilience::transport::{ServiceName, TransportTimeouts};
use crate::core::segmenter::SegmenterConfig;
use crate::core::vad::VadConfig;

/// All runtime knobs. Everything has a default suitable for local
/// development against services on their conventional ports.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    // Downstream service base URLs
    pub stt_url: String,
    pub context_llm_url: String,
    pub response_llm_url: String,
    pub tts_url: String,

    // Retry/backoff
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,

    // Timeouts
    pub stage_timeout_secs: u64,
    pub tts_timeout_secs: u64,

    // VAD / segmentation
    pub vad_energy_threshold: f32,
    pub max_silence_frames: u32,

    // Sessions
    pub session_ttl_secs: u64,
    pub max_history: usize,
    pub cache_persona_context: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if a set variable fails to parse.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_var("PORT", 8000u16)?;

        let stt_url =
            env::var("STT_SERVICE_URL").unwrap_or_else(|_| "http://localhost:8003".to_string());
        let context_llm_url =
            env::var("CONTEXT_LLM_URL").unwrap_or_else(|_| "http://localhost:8001".to_string());
        let response_llm_url =
            env::var("RESPONSE_LLM_URL").unwrap_or_else(|_| "http://localhost:8002".to_string());
        let tts_url =
            env::var("TTS_SERVICE_URL").unwrap_or_else(|_| "http://localhost:8004".to_string());

        let max_retries = parse_var("MAX_RETRIES", 3u32)?;
        let backoff_base_ms = parse_var("BACKOFF_BASE_MS", 500u64)?;
        let max_backoff_ms = parse_var("MAX_BACKOFF_MS", 8_000u64)?;

        let breaker_failure_threshold = parse_var("BREAKER_FAILURE_THRESHOLD", 3u32)?;
        let breaker_cooldown_secs = parse_var("BREAKER_COOLDOWN_SECS", 30u64)?;

        let stage_timeout_secs = parse_var("STAGE_TIMEOUT_SECS", 10u64)?;
        let tts_timeout_secs = parse_var("TTS_TIMEOUT_SECS", 60u64)?;

        let vad_energy_threshold = parse_var("VAD_ENERGY_THRESHOLD", 0.01f32)?;
        let max_silence_frames = parse_var("MAX_SILENCE_FRAMES", 10u32)?;

        let session_ttl_secs = parse_var("SESSION_TTL_SECS", 1_800u64)?;
        let max_history = parse_var("MAX_HISTORY", 12usize)?;
        let cache_persona_context = env::var("CACHE_PERSONA_CONTEXT")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);

        Ok(ServerConfig {
            host,
            port,
            stt_url,
            context_llm_url,
            response_llm_url,
            tts_url,
            max_retries,
            backoff_base_ms,
            max_backoff_ms,
            breaker_failure_threshold,
            breaker_cooldown_secs,
            stage_timeout_secs,
            tts_timeout_secs,
            vad_energy_threshold,
            max_silence_frames,
            session_ttl_secs,
            max_history,
            cache_persona_context,
        })
    }

    /// Bind address for the HTTP listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_urls(&self) -> HashMap<ServiceName, String> {
        HashMap::from([
            (ServiceName::Stt, self.stt_url.clone()),
            (ServiceName::ContextLlm, self.context_llm_url.clone()),
            (ServiceName::ResponseLlm, self.response_llm_url.clone()),
            (ServiceName::Tts, self.tts_url.clone()),
        ])
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    pub fn transport_timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            stage: Duration::from_secs(self.stage_timeout_secs),
            synthesis: Duration::from_secs(self.tts_timeout_secs),
            ..TransportTimeouts::default()
        }
    }

    pub fn vad_config(&self) -> VadConfig {
        VadConfig::default().with_energy_threshold(self.vad_energy_threshold)
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            max_silence_frames: self.max_silence_frames,
            ..SegmenterConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            cache_persona_context: self.cache_persona_context,
            ..PipelineConfig::default()
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| format!("Invalid {key}: {e}").into()),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
