//! Turn state machine.
//!
//! A [`TurnState`] is only ever mutated through the registry's
//! compare-and-set [`advance`](crate::turn::TurnRegistry::advance), which
//! consults [`TurnState::can_advance_to`].  The transitions are:
//!
//! ```text
//! Segmented ──▶ TranscribeDispatched ──▶ Transcribed
//!           ──▶ GenerateDispatched   ──▶ Generated
//!           ──▶ SynthesizeDispatched ──▶ Synthesized
//!           ──▶ Sequenced ──▶ Playing ──▶ Done
//!
//! any non-terminal state ──▶ Failed
//! ```
//!
//! A retry is *not* a state change: a dispatched state stays put while the
//! per-stage retry counter is incremented
//! ([`record_retry`](crate::turn::TurnRegistry::record_retry)).
//! `Done` and `Failed` are terminal and immutable.

use crate::stage::Stage;

// ---------------------------------------------------------------------------
// TurnState
// ---------------------------------------------------------------------------

/// States of one utterance's journey through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// The segmenter finalized the utterance and the turn was created.
    Segmented,
    /// A transcription request is in flight.
    TranscribeDispatched,
    /// The transcript text arrived.
    Transcribed,
    /// A generation request is in flight.
    GenerateDispatched,
    /// The generated reply text arrived.
    Generated,
    /// A synthesis request is in flight.
    SynthesizeDispatched,
    /// The synthesized audio handle arrived.
    Synthesized,
    /// Released by the sequencer, queued for playback.
    Sequenced,
    /// Audio is streaming into the voice channel.
    Playing,
    /// Playback finished — terminal.
    Done,
    /// The turn was abandoned — terminal.  The reason is recorded on the
    /// [`Turn`](crate::turn::Turn).
    Failed,
}

impl TurnState {
    /// Returns `true` when `next` is a legal successor of `self`.
    ///
    /// `Failed` is reachable from every non-terminal state; terminal states
    /// have no successors.
    ///
    /// ```
    /// use voice_pipeline::turn::TurnState;
    ///
    /// assert!(TurnState::Segmented.can_advance_to(TurnState::TranscribeDispatched));
    /// assert!(TurnState::Playing.can_advance_to(TurnState::Failed));
    /// assert!(!TurnState::Done.can_advance_to(TurnState::Failed));
    /// assert!(!TurnState::Transcribed.can_advance_to(TurnState::Segmented));
    /// ```
    pub fn can_advance_to(self, next: TurnState) -> bool {
        use TurnState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Segmented, TranscribeDispatched)
                | (TranscribeDispatched, Transcribed)
                | (Transcribed, GenerateDispatched)
                | (GenerateDispatched, Generated)
                | (Generated, SynthesizeDispatched)
                | (SynthesizeDispatched, Synthesized)
                | (Synthesized, Sequenced)
                | (Sequenced, Playing)
                | (Playing, Done)
        )
    }

    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Done | TurnState::Failed)
    }

    /// The stage whose request is in flight, for dispatched states.
    pub fn dispatched_stage(self) -> Option<Stage> {
        match self {
            TurnState::TranscribeDispatched => Some(Stage::Transcribe),
            TurnState::GenerateDispatched => Some(Stage::Generate),
            TurnState::SynthesizeDispatched => Some(Stage::Synthesize),
            _ => None,
        }
    }

    /// A short label for logs.
    pub fn label(self) -> &'static str {
        match self {
            TurnState::Segmented => "segmented",
            TurnState::TranscribeDispatched => "transcribe-dispatched",
            TurnState::Transcribed => "transcribed",
            TurnState::GenerateDispatched => "generate-dispatched",
            TurnState::Generated => "generated",
            TurnState::SynthesizeDispatched => "synthesize-dispatched",
            TurnState::Synthesized => "synthesized",
            TurnState::Sequenced => "sequenced",
            TurnState::Playing => "playing",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use TurnState::*;

    /// The full forward path, in order.
    const HAPPY_PATH: [TurnState; 11] = [
        Segmented,
        TranscribeDispatched,
        Transcribed,
        GenerateDispatched,
        Generated,
        SynthesizeDispatched,
        Synthesized,
        Sequenced,
        Playing,
        Done,
        Failed, // sentinel, not part of the chain
    ];

    #[test]
    fn happy_path_transitions_are_legal() {
        for pair in HAPPY_PATH[..10].windows(2) {
            assert!(
                pair[0].can_advance_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn skipping_a_state_is_illegal() {
        assert!(!Segmented.can_advance_to(Transcribed));
        assert!(!Transcribed.can_advance_to(Generated));
        assert!(!Synthesized.can_advance_to(Playing));
    }

    #[test]
    fn regressions_are_illegal() {
        assert!(!Transcribed.can_advance_to(Segmented));
        assert!(!Playing.can_advance_to(Sequenced));
        assert!(!Generated.can_advance_to(TranscribeDispatched));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for state in &HAPPY_PATH[..9] {
            assert!(state.can_advance_to(Failed), "{state} -> failed");
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for next in HAPPY_PATH {
            assert!(!Done.can_advance_to(next));
            assert!(!Failed.can_advance_to(next));
        }
    }

    #[test]
    fn terminal_predicate() {
        assert!(Done.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Segmented.is_terminal());
        assert!(!Playing.is_terminal());
    }

    #[test]
    fn dispatched_stage_mapping() {
        assert_eq!(TranscribeDispatched.dispatched_stage(), Some(Stage::Transcribe));
        assert_eq!(GenerateDispatched.dispatched_stage(), Some(Stage::Generate));
        assert_eq!(SynthesizeDispatched.dispatched_stage(), Some(Stage::Synthesize));
        assert_eq!(Transcribed.dispatched_stage(), None);
        assert_eq!(Done.dispatched_stage(), None);
    }

    #[test]
    fn labels_are_distinct() {
        let mut labels: Vec<&str> = HAPPY_PATH.iter().map(|s| s.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), 11);
    }
}
