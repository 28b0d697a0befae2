//! Ordered release buffer.
//!
//! Turns are numbered with a dense session-wide sequence at creation time.
//! The sequencer holds finished turns back until every earlier sequence slot
//! is accounted for, either by a finished turn or by a failure.
//!
//! ```text
//! seq:     0      1      2      3
//! state:  done   FAIL   done   synth'd
//! offer(3) → []            (0 released earlier, 2 blocked on 1)
//! mark_failed(1) → [2, 3]  (1's slot consumed, line drains)
//! ```
//!
//! Purely synchronous and single-owner; the per-session event loop is the
//! only caller, so there is no locking here.

use std::collections::{BTreeMap, BTreeSet};

use crate::turn::TurnId;

/// Per-session ordered release buffer.
pub struct Sequencer {
    /// The next sequence number allowed to leave.
    next_seq: u64,
    /// Finished turns waiting on earlier slots.
    ready: BTreeMap<u64, TurnId>,
    /// Failed slots at or beyond `next_seq`, consumed as the line advances.
    failed: BTreeSet<u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            ready: BTreeMap::new(),
            failed: BTreeSet::new(),
        }
    }

    /// A turn finished synthesis.  Returns every turn now releasable, in
    /// sequence order.
    pub fn offer(&mut self, seq: u64, turn: TurnId) -> Vec<TurnId> {
        if seq < self.next_seq {
            // Duplicate delivery of an already-released slot.
            log::debug!("sequencer: ignoring stale offer for seq {seq}");
            return Vec::new();
        }
        self.ready.insert(seq, turn);
        self.release()
    }

    /// A turn failed.  Its slot is consumed so later turns are not blocked.
    /// Returns turns unblocked by the failure, in sequence order.
    pub fn mark_failed(&mut self, seq: u64) -> Vec<TurnId> {
        if seq < self.next_seq {
            return Vec::new();
        }
        self.ready.remove(&seq);
        self.failed.insert(seq);
        self.release()
    }

    /// Turns still parked in the buffer, in sequence order.  Used at
    /// teardown to fail whatever never got released.
    pub fn pending(&mut self) -> Vec<TurnId> {
        let pending: Vec<TurnId> = self.ready.values().copied().collect();
        self.ready.clear();
        self.failed.clear();
        pending
    }

    fn release(&mut self) -> Vec<TurnId> {
        let mut released = Vec::new();
        loop {
            if self.failed.remove(&self.next_seq) {
                self.next_seq += 1;
                continue;
            }
            match self.ready.remove(&self.next_seq) {
                Some(turn) => {
                    released.push(turn);
                    self.next_seq += 1;
                }
                None => break,
            }
        }
        released
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{SessionId, SpeakerId};

    fn turn(seq: u64) -> TurnId {
        TurnId::new(SessionId(1), SpeakerId(1), seq)
    }

    #[test]
    fn in_order_turns_release_immediately() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0)]);
        assert_eq!(seq.offer(1, turn(1)), vec![turn(1)]);
    }

    #[test]
    fn out_of_order_completion_is_held_back() {
        let mut seq = Sequencer::new();
        // Seq 1 finishes first; it must wait for seq 0.
        assert_eq!(seq.offer(1, turn(1)), Vec::<TurnId>::new());
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0), turn(1)]);
    }

    #[test]
    fn failed_slot_does_not_block_the_line() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0)]);
        assert_eq!(seq.offer(2, turn(2)), Vec::<TurnId>::new());
        // Seq 1 fails; seq 2 drains right behind it.
        assert_eq!(seq.mark_failed(1), vec![turn(2)]);
    }

    #[test]
    fn failure_ahead_of_the_line_is_remembered() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.mark_failed(1), Vec::<TurnId>::new());
        assert_eq!(seq.mark_failed(2), Vec::<TurnId>::new());
        // Seq 0 arrives last and flushes through both failed slots.
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0)]);
        assert_eq!(seq.offer(3, turn(3)), vec![turn(3)]);
    }

    #[test]
    fn failure_of_a_parked_turn_removes_it() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.offer(1, turn(1)), Vec::<TurnId>::new());
        // The parked turn itself fails (e.g. teardown) before release.
        assert_eq!(seq.mark_failed(1), Vec::<TurnId>::new());
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0)]);
    }

    #[test]
    fn stale_offers_and_failures_are_ignored() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.offer(0, turn(0)), vec![turn(0)]);
        assert_eq!(seq.offer(0, turn(0)), Vec::<TurnId>::new());
        assert_eq!(seq.mark_failed(0), Vec::<TurnId>::new());
        assert_eq!(seq.offer(1, turn(1)), vec![turn(1)]);
    }

    #[test]
    fn pending_drains_parked_turns_in_order() {
        let mut seq = Sequencer::new();
        seq.offer(3, turn(3));
        seq.offer(1, turn(1));
        assert_eq!(seq.pending(), vec![turn(1), turn(3)]);
        assert_eq!(seq.pending(), Vec::<TurnId>::new());
    }
}
