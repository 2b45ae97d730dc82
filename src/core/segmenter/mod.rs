//! Utterance segmentation driven by per-frame VAD decisions.
//!
//! The segmenter turns a stream of speech/silence classifications into
//! discrete utterances using silence-run hysteresis:
//!
//! ```text
//! [Idle] ─── speech ──► [Speaking]  (SpeakingStarted)
//!    │                      │
//!    └── silence ─► (no-op) │
//!                           │
//! [Speaking] ─── speech ──► [Speaking]  (silence run resets)
//! [Speaking] ─── silence ─► silence run += 1; at max_silence_frames
//!                           ──► [Idle]  (SpeakingEnded with the buffer)
//! ```
//!
//! Trailing silence frames are appended to the buffer before the utterance
//! closes, so the emitted audio keeps its natural boundary. There is no
//! minimum-duration floor: a single speech frame followed by the silence run
//! still yields an utterance.

use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Configuration for utterance segmentation.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Consecutive silence frames that close an utterance.
    /// 10 frames of 32 ms ≈ 320 ms of silence.
    pub max_silence_frames: u32,
    /// Hard cap on the utterance buffer; reaching it force-closes the
    /// utterance instead of growing without bound.
    pub max_utterance_bytes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_silence_frames: 10,
            // 30 seconds of 16 kHz PCM16.
            max_utterance_bytes: 30 * 16_000 * 2,
        }
    }
}

impl SegmenterConfig {
    pub fn with_max_silence_frames(mut self, frames: u32) -> Self {
        self.max_silence_frames = frames;
        self
    }
}

/// Event emitted by [`UtteranceSegmenter::push_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmenterEvent {
    /// First speech frame after idle; accumulation has begun.
    SpeakingStarted,
    /// Utterance closed; `audio` holds every accumulated frame, trailing
    /// silence included.
    SpeakingEnded { audio: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
}

/// Per-connection utterance segmenter.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    config: SegmenterConfig,
    state: SegmentState,
    buffer: BytesMut,
    silence_run: u32,
}

impl UtteranceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: SegmentState::Idle,
            buffer: BytesMut::new(),
            silence_run: 0,
        }
    }

    /// Whether an utterance is currently being accumulated.
    pub fn is_speaking(&self) -> bool {
        self.state == SegmentState::Speaking
    }

    /// Feed one classified frame through the state machine.
    pub fn push_frame(&mut self, frame: &[u8], is_speech: bool) -> Option<SegmenterEvent> {
        match (self.state, is_speech) {
            (SegmentState::Idle, false) => None,
            (SegmentState::Idle, true) => {
                self.state = SegmentState::Speaking;
                self.silence_run = 0;
                self.buffer.extend_from_slice(frame);
                Some(SegmenterEvent::SpeakingStarted)
            }
            (SegmentState::Speaking, true) => {
                self.silence_run = 0;
                self.buffer.extend_from_slice(frame);
                self.check_overflow()
            }
            (SegmentState::Speaking, false) => {
                self.silence_run += 1;
                self.buffer.extend_from_slice(frame);
                if self.silence_run >= self.config.max_silence_frames {
                    Some(self.close_utterance())
                } else {
                    self.check_overflow()
                }
            }
        }
    }

    /// Drop any partially accumulated utterance and return to idle.
    pub fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.silence_run = 0;
        self.buffer.clear();
    }

    fn check_overflow(&mut self) -> Option<SegmenterEvent> {
        if self.buffer.len() >= self.config.max_utterance_bytes {
            debug!(
                buffered = self.buffer.len(),
                cap = self.config.max_utterance_bytes,
                "utterance buffer at capacity, force-closing"
            );
            Some(self.close_utterance())
        } else {
            None
        }
    }

    /// Hand off the buffer and reset atomically for the next utterance.
    fn close_utterance(&mut self) -> SegmenterEvent {
        let audio = self.buffer.split().freeze();
        self.state = SegmentState::Idle;
        self.silence_run = 0;
        SegmenterEvent::SpeakingEnded { audio }
    }
}

impl Default for UtteranceSegmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}
