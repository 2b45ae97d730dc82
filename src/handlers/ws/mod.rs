//! # WebSocket Voice Session Module
//!
//! Real-time voice conversations over a single WebSocket connection.
//!
//! ## Connection Flow
//! 1. Client connects to `/ws` endpoint
//! 2. Client sends an `init` message with its character selection
//! 3. Server stores a session and answers with a `greeting` message
//! 4. Client streams raw PCM16 audio as binary frames
//! 5. Server segments utterances, runs the pipeline, and streams back the
//!    transcript, the reply text, and synthesized audio chunks
//! 6. Speaking over the assistant cancels playback (`barge_in`) and the
//!    interrupting speech starts the next utterance
//!
//! ## Message Types
//!
//! **Incoming:**
//! - `{"type": "init", "character_details": {"name": "...", "personality": "..."}}` - start the session
//! - `{"type": "ping"}` - keepalive, answered with `pong`
//! - **Binary messages** - raw 16 kHz mono PCM16 audio frames
//!
//! **Outgoing:**
//! - `{"type": "greeting", "text": "..."}` - opening line after init
//! - `{"type": "vad_state", "speaking": true|false}` - speech edges
//! - `{"type": "transcript_final", "text": "..."}` - what the user said
//! - `{"type": "assistant_final", "text": "..."}` - the reply text
//! - `{"type": "tts_chunk", "audio": "<base64>"}` - one audio chunk
//! - `{"type": "tts_end"}` - synthesis finished
//! - `{"type": "barge_in"}` - playback cancelled by user speech
//! - `{"type": "pong"}` - keepalive reply
//! - `{"type": "error", "message": "...", "detail": "..."}` - failures; fatal
//!   only before init

pub mod driver;
pub mod handler;
pub mod messages;

pub use driver::{InboundFrame, SessionDriver};
pub use handler::ws_session_handler;
pub use messages::{IncomingMessage, OutgoingMessage};
