//! WebSocket message types for voice sessions.
//!
//! Text frames carry JSON tagged by `type`; binary frames carry raw PCM16
//! audio and never appear here. Outbound audio travels as base64 inside
//! `tts_chunk` messages.

use serde::{Deserialize, Serialize};

use crate::core::session::CharacterDetails;

/// Client-to-server JSON messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    /// Handshake. Must be the first message on the connection.
    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        character_details: CharacterDetails,
    },
    /// Keepalive, answered with `pong`.
    #[serde(rename = "ping")]
    Ping,
}

/// Server-to-client JSON messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    /// Canned opening line, sent right after a successful init.
    #[serde(rename = "greeting")]
    Greeting { text: String },
    /// Speech/silence edge from the segmenter.
    #[serde(rename = "vad_state")]
    VadState { speaking: bool },
    /// Final transcript of the user's utterance.
    #[serde(rename = "transcript_final")]
    TranscriptFinal { text: String },
    /// Final assistant reply text, sent before its audio.
    #[serde(rename = "assistant_final")]
    AssistantFinal { text: String },
    /// One chunk of synthesized audio, base64-encoded.
    #[serde(rename = "tts_chunk")]
    TtsChunk { audio: String },
    /// Synthesis for the current reply finished.
    #[serde(rename = "tts_end")]
    TtsEnd,
    /// The user spoke over the assistant; playback was cancelled.
    #[serde(rename = "barge_in")]
    BargeIn,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}
