//! Conversation session model.
//!
//! A [`Session`] holds everything a conversation accumulates between turns:
//! the character the caller selected, the persona context built for that
//! character, and a bounded rolling history of user/assistant exchanges.
//! Persistence lives in [`store`].

pub mod store;

pub use store::{MemorySessionBackend, SessionBackend, SessionStore, StoreError};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Default cap on stored turns per session. History is trimmed oldest-first
/// once this many entries accumulate.
pub const DEFAULT_MAX_HISTORY: usize = 12;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// A single utterance in the conversation history. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub sender: Sender,
    pub content: String,
    /// Unix seconds at append time.
    pub timestamp: u64,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Sender::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, content)
    }

    fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            timestamp: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Where the session is in its speak/listen cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    UserSpeaking,
    AwaitingPipeline,
    AssistantSpeaking,
}

/// Character selection supplied by the client at session start. Unknown
/// fields are accepted and dropped; only name and persona travel downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterDetails {
    #[serde(default = "default_character_name")]
    pub name: String,
    /// Accepted under the client's key `personality`.
    #[serde(default = "default_persona", rename = "personality")]
    pub persona: String,
    /// Voice selection forwarded to synthesis.
    #[serde(default = "default_voice_type")]
    pub voice_type: String,
}

fn default_character_name() -> String {
    "Assistant".to_string()
}

fn default_persona() -> String {
    "friendly".to_string()
}

fn default_voice_type() -> String {
    "predefined".to_string()
}

impl Default for CharacterDetails {
    fn default() -> Self {
        Self {
            name: default_character_name(),
            persona: default_persona(),
            voice_type: default_voice_type(),
        }
    }
}

/// Output of the context stage, cached on the session: the persona prompt
/// plus the structured rules the response stage consumes alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaContext {
    pub context: String,
    #[serde(default)]
    pub rules: serde_json::Map<String, serde_json::Value>,
}

/// Full per-session state, serialized as JSON by the store. Audio buffers
/// and cancellation tokens stay in the connection task, never in here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub character: CharacterDetails,
    /// Persona context returned by the context service, cached for the life
    /// of the session once built.
    pub persona_context: Option<PersonaContext>,
    pub history: Vec<Turn>,
    pub turn_state: TurnState,
    pub max_history: usize,
}

impl Session {
    pub fn new(character: CharacterDetails) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), character)
    }

    pub fn with_id(id: impl Into<String>, character: CharacterDetails) -> Self {
        Self {
            id: id.into(),
            character,
            persona_context: None,
            history: Vec::new(),
            turn_state: TurnState::Idle,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Records one completed exchange, trimming oldest turns so the history
    /// never exceeds `max_history` entries.
    pub fn push_turn_pair(
        &mut self,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
    ) {
        self.history.push(Turn::user(user_text));
        self.history.push(Turn::assistant(assistant_text));
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }

    /// The most recent `window` turns, oldest first, for prompt assembly.
    pub fn recent_history(&self, window: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    /// Opening line spoken when the session connects.
    pub fn greeting(&self) -> String {
        format!(
            "Hello, I am {}! How can I help you today?",
            self.character.name
        )
    }
}
