//! Voice activity detection over fixed-size PCM frames.
//!
//! The detector classifies one frame at a time (no cross-frame state) using
//! the RMS energy of the window against a configurable threshold. Frames are
//! 16 kHz mono 16-bit signed little-endian PCM; one classification window is
//! `frame_samples` samples.

use tracing::warn;

/// Errors produced while classifying a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VadError {
    /// The frame does not match the expected window length.
    #[error("expected {expected}-byte frame, got {got} bytes")]
    Format { expected: usize, got: usize },
}

/// Configuration for the frame classifier.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Sample rate in Hz. The pipeline assumes 16 kHz mono throughout.
    pub sample_rate: u32,
    /// Samples per classification window (512 at 16 kHz = 32 ms).
    pub frame_samples: usize,
    /// Normalized RMS energy above which a frame counts as speech.
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 512,
            energy_threshold: 0.01,
        }
    }
}

impl VadConfig {
    /// Duration of one classification window in milliseconds.
    pub fn frame_duration_ms(&self) -> f32 {
        (self.frame_samples as f32 / self.sample_rate as f32) * 1000.0
    }

    pub fn with_energy_threshold(mut self, threshold: f32) -> Self {
        self.energy_threshold = threshold;
        self
    }
}

/// Stateless per-frame speech/silence classifier.
#[derive(Debug, Clone)]
pub struct VadDetector {
    config: VadConfig,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> Self {
        Self { config }
    }

    /// Expected frame size in bytes (two bytes per PCM16 sample).
    pub fn frame_bytes(&self) -> usize {
        self.config.frame_samples * 2
    }

    /// Classify a single frame. `Ok(true)` means speech.
    ///
    /// Frames of the wrong length are rejected so the caller can log and
    /// skip them rather than feeding garbage into segmentation.
    pub fn classify(&self, frame: &[u8]) -> Result<bool, VadError> {
        let expected = self.frame_bytes();
        if frame.len() != expected {
            return Err(VadError::Format {
                expected,
                got: frame.len(),
            });
        }

        Ok(rms_energy(frame) > self.config.energy_threshold)
    }

    /// Fail-closed variant: malformed input is treated as silence.
    ///
    /// A misclassified frame must never take down the session loop, so this
    /// is what barge-in monitoring uses.
    pub fn classify_or_silence(&self, frame: &[u8]) -> bool {
        match self.classify(frame) {
            Ok(speech) => speech,
            Err(e) => {
                warn!("VAD rejected frame, treating as silence: {e}");
                false
            }
        }
    }
}

/// Normalized RMS energy of a little-endian PCM16 byte window.
fn rms_energy(frame: &[u8]) -> f32 {
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for chunk in frame.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / i16::MAX as f64;
        sum_sq += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt() as f32
}
