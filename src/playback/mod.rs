//! Ordered release and serialized playback.
//!
//! Synthesized turns finish in arbitrary order; listeners must hear them in
//! submission order, one at a time.  Two pieces enforce that:
//!
//! * [`Sequencer`] — a pure ordered-release buffer keyed by the session-wide
//!   sequence number.  Failed turns consume their slot so the line never
//!   stalls behind a dead turn.
//! * [`PlaybackGate`] — a task that drains released turns and plays them
//!   through an [`AudioSink`] strictly one at a time.

pub mod gate;
pub mod sequencer;

use async_trait::async_trait;
use thiserror::Error;

use crate::audio::AudioHandle;
use crate::turn::TurnId;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use gate::PlaybackGate;
pub use sequencer::Sequencer;

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Errors surfaced by an [`AudioSink`].
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    /// The voice-channel output rejected or lost the audio.
    #[error("playback output error: {0}")]
    Output(String),
}

// ---------------------------------------------------------------------------
// AudioSink
// ---------------------------------------------------------------------------

/// The voice-channel output boundary.
///
/// `play` resolves the [`AudioHandle`] and blocks until the audio has been
/// fully delivered (or rejected).  The gate calls it for one turn at a time;
/// implementations never see overlapping calls for the same session.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, turn: TurnId, audio: &AudioHandle) -> Result<(), PlaybackError>;
}

// ---------------------------------------------------------------------------
// ReleasedTurn
// ---------------------------------------------------------------------------

/// A turn the sequencer has released for playback.
#[derive(Debug, Clone)]
pub struct ReleasedTurn {
    pub turn: TurnId,
    pub audio: AudioHandle,
}
