//! Per-session pipeline orchestration.
//!
//! One [`PipelineRunner`] task runs per session and owns everything with
//! per-session state: the segmenter, the sequence counters, and the ordered
//! release buffer.  It serializes all decisions through a single
//! `tokio::sync::mpsc` event loop; the only things happening off that loop
//! are the dispatcher's in-flight stage calls and the playback gate.
//!
//! # Flow
//!
//! ```text
//! PipelineEvent::Frame ──▶ Segmenter ──▶ create turn ──▶ submit transcribe
//!
//! StageCompleted(transcribe) ──▶ advance ──▶ submit generate
//! StageCompleted(generate)   ──▶ advance ──▶ submit synthesize
//! StageCompleted(synthesize) ──▶ advance ──▶ Sequencer ──▶ PlaybackGate
//! StageFailed                ──▶ mark failed ──▶ Sequencer skips it
//! ```
//!
//! Stage completions arrive in any order; stale or duplicate deliveries
//! bounce off the registry's compare-and-set and are discarded at `debug!`.

pub mod runner;

use crate::audio::AudioFrame;
use crate::stage::{Stage, StagePayload};
use crate::turn::{FailureReason, TurnId};

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use runner::PipelineRunner;

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Everything the per-session event loop reacts to.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A labeled audio frame from the capture boundary.
    Frame(AudioFrame),

    /// A stage call finished successfully.  Emitted by dispatcher tasks;
    /// delivery order is unrelated to submission order.
    StageCompleted {
        turn: TurnId,
        stage: Stage,
        payload: StagePayload,
    },

    /// A stage exhausted its retry budget (or failed terminally).
    StageFailed {
        turn: TurnId,
        stage: Stage,
        reason: FailureReason,
    },
}
