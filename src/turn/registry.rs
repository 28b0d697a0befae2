//! Turn registry — the single mutable source of truth per turn.
//!
//! # Locking
//!
//! Every turn lives behind its own `Arc<Mutex<Turn>>`.  The outer map lock is
//! held only long enough to clone that `Arc`, so concurrent transitions on
//! distinct turns never contend; serialization happens per turn, not per
//! session.
//!
//! # Compare-and-set
//!
//! [`TurnRegistry::advance`] is a transactional compare-and-set: the caller
//! states the `from` state it believes the turn is in, and the transition is
//! rejected with [`RegistryError::StaleTransition`] when that belief is out
//! of date.  Duplicate and late stage responses land here and are discarded
//! by the caller at `debug!` — stale delivery is an expected case, not a
//! fault.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::audio::AudioHandle;
use crate::stage::{Stage, StagePayload};
use crate::turn::{FailureReason, SessionId, Turn, TurnId, TurnState};

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors raised by turn creation and state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A turn with the same (speaker, sequence) pair already exists.
    /// Programming or race error — rejected at creation.
    #[error("duplicate turn {0}")]
    DuplicateTurn(TurnId),

    /// The turn id is not (or no longer) registered.
    #[error("unknown turn {0}")]
    UnknownTurn(TurnId),

    /// The compare-and-set failed: the turn is not in the expected state.
    /// Expected under concurrent or duplicate stage responses.
    #[error("stale transition on {id}: expected {expected}, found {found}")]
    StaleTransition {
        id: TurnId,
        expected: TurnState,
        found: TurnState,
    },

    /// The requested edge is not part of the state machine.
    #[error("invalid transition on {id}: {from} -> {to}")]
    InvalidTransition {
        id: TurnId,
        from: TurnState,
        to: TurnState,
    },

    /// The payload kind does not fit the target state.
    #[error("payload does not fit state {state} on {id}")]
    PayloadMismatch { id: TurnId, state: TurnState },

    /// The turn already reached `Done` or `Failed` — terminal states are
    /// immutable, so a turn can only be failed once.
    #[error("turn {0} is already terminal")]
    AlreadyTerminal(TurnId),
}

// ---------------------------------------------------------------------------
// TurnRegistry
// ---------------------------------------------------------------------------

/// In-memory record of every turn moving through the pipeline.
///
/// Shared as `Arc<TurnRegistry>` across the segmenter driver, dispatcher
/// callbacks, sequencer, and playback gate.
#[derive(Default)]
pub struct TurnRegistry {
    turns: Mutex<HashMap<TurnId, Arc<Mutex<Turn>>>>,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a turn in state [`TurnState::Segmented`].
    ///
    /// `global_seq` is the session-wide submission order used by the
    /// sequencer; the caller allocates it together with the per-speaker
    /// sequence inside `id`.
    pub fn create_turn(
        &self,
        id: TurnId,
        global_seq: u64,
        segment: AudioHandle,
    ) -> Result<TurnId, RegistryError> {
        let mut turns = self.turns.lock().unwrap();
        if turns.contains_key(&id) {
            return Err(RegistryError::DuplicateTurn(id));
        }
        turns.insert(id, Arc::new(Mutex::new(Turn::new(id, global_seq, segment))));
        log::debug!("registry: created {id} (global_seq={global_seq})");
        Ok(id)
    }

    /// Transactional compare-and-set transition.
    ///
    /// Stores `payload` into the slot matching `to` (`Transcribed` →
    /// transcript, `Generated` → reply, `Synthesized` → synthesized audio)
    /// and returns the post-transition snapshot.
    pub fn advance(
        &self,
        id: TurnId,
        from: TurnState,
        to: TurnState,
        payload: Option<StagePayload>,
    ) -> Result<Turn, RegistryError> {
        let slot = self.slot(id)?;
        let mut turn = slot.lock().unwrap();

        if turn.state != from {
            return Err(RegistryError::StaleTransition {
                id,
                expected: from,
                found: turn.state,
            });
        }
        if !from.can_advance_to(to) {
            return Err(RegistryError::InvalidTransition { id, from, to });
        }

        match (to, payload) {
            (TurnState::Transcribed, Some(StagePayload::Text(text))) => {
                turn.transcript = Some(text);
            }
            (TurnState::Generated, Some(StagePayload::Text(text))) => {
                turn.reply = Some(text);
            }
            (TurnState::Synthesized, Some(StagePayload::Audio(audio))) => {
                turn.synthesized = Some(audio);
            }
            (_, None) => {}
            (state, Some(_)) => {
                return Err(RegistryError::PayloadMismatch { id, state });
            }
        }

        turn.state = to;
        turn.updated_at = Instant::now();
        log::debug!("registry: {id} {from} -> {to}");
        Ok(turn.clone())
    }

    /// Record one retry of `stage` while the turn sits in that stage's
    /// dispatched state.  Returns the new retry count.
    ///
    /// A [`RegistryError::StaleTransition`] here means the turn has already
    /// moved on (a late timeout racing a success, or a teardown) — the
    /// caller abandons the retry silently.
    pub fn record_retry(&self, id: TurnId, stage: Stage) -> Result<u32, RegistryError> {
        let slot = self.slot(id)?;
        let mut turn = slot.lock().unwrap();

        let expected = stage.dispatched_state();
        if turn.state != expected {
            return Err(RegistryError::StaleTransition {
                id,
                expected,
                found: turn.state,
            });
        }

        turn.updated_at = Instant::now();
        let count = turn.bump_retry(stage);
        log::debug!("registry: {id} retry #{count} for {stage}");
        Ok(count)
    }

    /// Terminal transition to [`TurnState::Failed`], recording the reason.
    ///
    /// Fails with [`RegistryError::AlreadyTerminal`] when the turn is
    /// already `Done` or `Failed`, so a turn is failed exactly once.
    pub fn mark_failed(&self, id: TurnId, reason: FailureReason) -> Result<Turn, RegistryError> {
        let slot = self.slot(id)?;
        let mut turn = slot.lock().unwrap();

        if turn.state.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(id));
        }

        log::warn!("registry: {id} failed in {}: {reason}", turn.state);
        turn.state = TurnState::Failed;
        turn.failure = Some(reason);
        turn.updated_at = Instant::now();
        Ok(turn.clone())
    }

    /// Read-only snapshot of a turn.
    pub fn get(&self, id: TurnId) -> Option<Turn> {
        let slot = {
            let turns = self.turns.lock().unwrap();
            turns.get(&id).cloned()
        };
        slot.map(|s| s.lock().unwrap().clone())
    }

    /// Snapshots of every turn belonging to `session`.
    pub fn session_turns(&self, session: SessionId) -> Vec<Turn> {
        let slots: Vec<Arc<Mutex<Turn>>> = {
            let turns = self.turns.lock().unwrap();
            turns
                .iter()
                .filter(|(id, _)| id.session == session)
                .map(|(_, slot)| Arc::clone(slot))
                .collect()
        };
        let mut snapshots: Vec<Turn> = slots.iter().map(|s| s.lock().unwrap().clone()).collect();
        snapshots.sort_by_key(|t| t.global_seq);
        snapshots
    }

    /// Number of non-terminal turns in `session` — the basis for the
    /// per-session concurrency cap.
    pub fn active_count(&self, session: SessionId) -> usize {
        self.session_turns(session)
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Drop every turn belonging to `session`.  Called after teardown has
    /// marked the stragglers failed.
    pub fn remove_session(&self, session: SessionId) {
        let mut turns = self.turns.lock().unwrap();
        let before = turns.len();
        turns.retain(|id, _| id.session != session);
        log::debug!(
            "registry: removed {} turns for {session}",
            before - turns.len()
        );
    }

    fn slot(&self, id: TurnId) -> Result<Arc<Mutex<Turn>>, RegistryError> {
        let turns = self.turns.lock().unwrap();
        turns
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownTurn(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
