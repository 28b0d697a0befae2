//! Turn identity, record, and registry.
//!
//! A **turn** is one detected utterance and its end-to-end processing record.
//! The [`TurnRegistry`] is the single mutable source of truth per turn —
//! every other component holds a [`TurnId`] and reads snapshots, never
//! mutable state.
//!
//! # Identity
//!
//! ```text
//! TurnId = session id + speaker id + per-speaker sequence number
//!          "s1:u42:7"
//! ```
//!
//! A session-wide `global_seq`, allocated at creation time, defines the
//! cross-speaker interleaving order used by the sequencer.

pub mod registry;
pub mod state;

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::audio::AudioHandle;
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use registry::{RegistryError, TurnRegistry};
pub use state::TurnState;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// One active voice-channel conversation context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A per-participant stream identity within a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SpeakerId(pub u64);

impl std::fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Unique identity of one turn: session, speaker, per-speaker sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TurnId {
    pub session: SessionId,
    pub speaker: SpeakerId,
    /// Per-speaker sequence number, starting at 0.
    pub seq: u64,
}

impl TurnId {
    pub fn new(session: SessionId, speaker: SpeakerId, seq: u64) -> Self {
        Self {
            session,
            speaker,
            seq,
        }
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.session, self.speaker, self.seq)
    }
}

// ---------------------------------------------------------------------------
// FailureReason
// ---------------------------------------------------------------------------

/// Why a turn reached [`TurnState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A remote stage exhausted its retry budget.
    Stage {
        stage: Stage,
        attempts: u32,
        message: String,
    },
    /// The voice-channel output rejected the synthesized audio.
    Playback { message: String },
    /// The session was torn down while the turn was still in flight.
    /// Cancellation, not a fault.
    SessionClosed,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Stage {
                stage,
                attempts,
                message,
            } => write!(f, "{stage} failed after {attempts} attempts: {message}"),
            FailureReason::Playback { message } => write!(f, "playback failed: {message}"),
            FailureReason::SessionClosed => write!(f, "session closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One utterance's processing record.
///
/// Mutable state is owned exclusively by the [`TurnRegistry`]; everything
/// handed out is a snapshot clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    /// Session-wide submission order, allocated at creation.
    pub global_seq: u64,
    pub state: TurnState,
    /// The captured utterance audio.
    pub segment: AudioHandle,
    /// Transcription output, present from `Transcribed` onward.
    pub transcript: Option<String>,
    /// Generation output, present from `Generated` onward.
    pub reply: Option<String>,
    /// Synthesis output, present from `Synthesized` onward.
    pub synthesized: Option<AudioHandle>,
    /// Why the turn failed, when `state == Failed`.
    pub failure: Option<FailureReason>,
    pub created_at: Instant,
    /// Timestamp of the most recent transition or retry.
    pub updated_at: Instant,
    /// Per-stage retry counters, indexed by [`Stage::index`].
    retries: [u32; Stage::ALL.len()],
}

impl Turn {
    pub(crate) fn new(id: TurnId, global_seq: u64, segment: AudioHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            global_seq,
            state: TurnState::Segmented,
            segment,
            transcript: None,
            reply: None,
            synthesized: None,
            failure: None,
            created_at: now,
            updated_at: now,
            retries: [0; Stage::ALL.len()],
        }
    }

    /// How many retries this stage has consumed so far.
    pub fn retries(&self, stage: Stage) -> u32 {
        self.retries[stage.index()]
    }

    pub(crate) fn bump_retry(&mut self, stage: Stage) -> u32 {
        self.retries[stage.index()] += 1;
        self.retries[stage.index()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_formats() {
        let id = TurnId::new(SessionId(1), SpeakerId(42), 7);
        assert_eq!(id.to_string(), "s1:u42:7");
        assert_eq!(SessionId(3).to_string(), "s3");
        assert_eq!(SpeakerId(9).to_string(), "u9");
    }

    #[test]
    fn new_turn_starts_segmented_with_empty_payloads() {
        let id = TurnId::new(SessionId(1), SpeakerId(1), 0);
        let turn = Turn::new(id, 0, AudioHandle::new("user_1_0", 500));

        assert_eq!(turn.state, TurnState::Segmented);
        assert!(turn.transcript.is_none());
        assert!(turn.reply.is_none());
        assert!(turn.synthesized.is_none());
        assert!(turn.failure.is_none());
        for stage in Stage::ALL {
            assert_eq!(turn.retries(stage), 0);
        }
    }

    #[test]
    fn retry_counters_are_per_stage() {
        let id = TurnId::new(SessionId(1), SpeakerId(1), 0);
        let mut turn = Turn::new(id, 0, AudioHandle::new("user_1_0", 500));

        assert_eq!(turn.bump_retry(Stage::Generate), 1);
        assert_eq!(turn.bump_retry(Stage::Generate), 2);
        assert_eq!(turn.retries(Stage::Generate), 2);
        assert_eq!(turn.retries(Stage::Transcribe), 0);
        assert_eq!(turn.retries(Stage::Synthesize), 0);
    }

    #[test]
    fn failure_reason_display() {
        let reason = FailureReason::Stage {
            stage: Stage::Transcribe,
            attempts: 3,
            message: "connection refused".into(),
        };
        assert_eq!(
            reason.to_string(),
            "transcribe failed after 3 attempts: connection refused"
        );
        assert_eq!(FailureReason::SessionClosed.to_string(), "session closed");
    }
}
