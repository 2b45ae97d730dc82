//! Stage identities, failure types and wire DTOs for the pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// The four pipeline stages, in execution order for voice turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stt,
    Context,
    Response,
    Tts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stt => "stt",
            Stage::Context => "context",
            Stage::Response => "response",
            Stage::Tts => "tts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone)]
pub enum StageCause {
    /// Breaker was open; the stage made no network attempt.
    CircuitOpen { retry_after: Duration },
    /// Retry budget exhausted or the breaker tripped mid-call.
    Exhausted { details: String },
    /// The service answered but with an empty transcript or reply.
    Empty,
    /// The service answered 2xx but the body did not have the expected shape.
    Malformed { details: String },
}

/// A turn-aborting stage failure. The structured cause is for logs and
/// error payloads; [`StageError::user_message`] is what gets spoken or
/// shown to the end user.
#[derive(Debug, Clone, Error)]
#[error("{stage} stage failed: {}", self.cause_summary())]
pub struct StageError {
    pub stage: Stage,
    pub cause: StageCause,
}

impl StageError {
    pub fn new(stage: Stage, cause: StageCause) -> Self {
        Self { stage, cause }
    }

    pub fn empty(stage: Stage) -> Self {
        Self::new(stage, StageCause::Empty)
    }

    fn cause_summary(&self) -> String {
        match &self.cause {
            StageCause::CircuitOpen { retry_after } => {
                format!("circuit open, retry after {retry_after:?}")
            }
            StageCause::Exhausted { details } => details.clone(),
            StageCause::Empty => "empty result".to_string(),
            StageCause::Malformed { details } => format!("malformed response: {details}"),
        }
    }

    /// Stage-specific apology, safe to surface verbatim. Never carries
    /// downstream error detail.
    pub fn user_message(&self) -> &'static str {
        match self.stage {
            Stage::Stt => "I'm sorry, I couldn't quite hear that. Could you say it again?",
            Stage::Context => {
                "I'm sorry, I'm having trouble getting into character right now. \
                 Please try again in a moment."
            }
            Stage::Response => {
                "I'm sorry, I'm having trouble thinking of a reply right now. \
                 Please try again in a moment."
            }
            Stage::Tts => "I'm sorry, I lost my voice for a moment. Please try again.",
        }
    }
}

/// Result of a chat turn (no audio stages).
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub reply: String,
}

/// Result of a streamed voice turn. `audio` yields raw synthesis chunks
/// until the stream ends or the turn's cancel token fires.
#[derive(Debug)]
pub struct VoiceTurn {
    pub transcript: String,
    pub reply: String,
    pub audio: mpsc::Receiver<Bytes>,
}

/// Result of a non-streamed (REST) voice turn.
#[derive(Debug, Clone)]
pub struct VoiceRestTurn {
    pub transcript: String,
    pub reply: String,
    /// Base64-encoded synthesis output.
    pub audio_data: String,
}

// Downstream wire shapes. Field names follow the services' JSON contracts.

#[derive(Debug, Serialize)]
pub struct ContextRequest {
    pub user_input: String,
    pub character_details: FilteredCharacter,
}

/// Only name and persona are forwarded to the context service; any other
/// client-supplied character fields are dropped at this boundary.
#[derive(Debug, Serialize)]
pub struct FilteredCharacter {
    pub name: String,
    pub persona: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextResponse {
    pub context: String,
    /// Structured constraints (persona, forbidden topics, voice selection).
    /// Forwarded verbatim to the response stage.
    #[serde(default)]
    pub rules: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ResponseRequest {
    pub user_query: String,
    pub persona_context: String,
    pub rules: serde_json::Map<String, serde_json::Value>,
    pub history: Vec<HistoryEntry>,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ResponseResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct SttRequest {
    /// Base64-encoded PCM16 audio.
    pub audio_data: String,
}

#[derive(Debug, Deserialize)]
pub struct SttResponse {
    pub transcript: String,
}

#[derive(Debug, Serialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice_selector: String,
}

#[derive(Debug, Deserialize)]
pub struct TtsResponse {
    /// Base64-encoded audio.
    pub audio_data: String,
}
