//! Audio frame and handle types shared across the pipeline.
//!
//! The orchestration core never touches raw audio beyond the energy
//! measurement the segmenter needs.  Utterance and synthesis audio move
//! through the pipeline as [`AudioHandle`] references; the bytes themselves
//! live with the capture / synthesis collaborators (the stage services read
//! and write them through a shared store keyed by handle id).

use serde::{Deserialize, Serialize};

use crate::turn::SpeakerId;

/// Sample rate every capture collaborator must deliver: 16 kHz mono f32 PCM.
pub const SAMPLE_RATE: u32 = 16_000;

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// One labeled PCM frame from the capture boundary.
///
/// Frames carry a monotonic capture timestamp per speaker.  Frame loss or
/// reordering beyond a small jitter window is an upstream error — the
/// segmenter consumes frames in the order they arrive.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Which participant produced this frame.
    pub speaker: SpeakerId,
    /// Monotonic capture timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// 16 kHz mono f32 samples.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Frame duration in milliseconds, derived from the sample count.
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1_000 / SAMPLE_RATE as u64
    }
}

// ---------------------------------------------------------------------------
// AudioHandle
// ---------------------------------------------------------------------------

/// Opaque reference to a stored audio clip.
///
/// Handles are minted by the segmenter (utterance audio) or returned by the
/// synthesis stage (reply audio).  The orchestrator only routes them; it
/// never dereferences them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHandle {
    /// Store key, e.g. `user_7_183220`.
    pub id: String,
    /// Clip length in milliseconds.
    pub duration_ms: u64,
}

impl AudioHandle {
    pub fn new(id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            duration_ms,
        }
    }
}

impl std::fmt::Display for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} ms)", self.id, self.duration_ms)
    }
}

// ---------------------------------------------------------------------------
// rms
// ---------------------------------------------------------------------------

/// Root-mean-square amplitude of a frame.
///
/// Returns `0.0` for an empty slice so silent and missing audio classify the
/// same way.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    mean_sq.sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
