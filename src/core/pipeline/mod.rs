//! Conversation pipeline: STT, context, response and TTS stages composed
//! over the resilient downstream client.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{Orchestrator, PipelineConfig};
pub use types::{ChatTurn, Stage, StageCause, StageError, VoiceRestTurn, VoiceTurn};
