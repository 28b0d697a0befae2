//! Playback gate — one turn's audio at a time.
//!
//! The gate is a single task per session pulling [`ReleasedTurn`]s off the
//! sequencer's channel.  Because it `await`s each [`AudioSink::play`] before
//! pulling the next release, serialization is structural: no lock, no
//! counter, just the loop.
//!
//! A playback failure fails that turn only; the loop carries on with the
//! next release.  On teardown the current playback is cancelled and every
//! queued release is failed with `SessionClosed`.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::playback::{AudioSink, ReleasedTurn};
use crate::turn::{FailureReason, TurnRegistry, TurnState};

/// Serializes voice-channel output for one session.
pub struct PlaybackGate {
    registry: Arc<TurnRegistry>,
    sink: Arc<dyn AudioSink>,
}

impl PlaybackGate {
    pub fn new(registry: Arc<TurnRegistry>, sink: Arc<dyn AudioSink>) -> Self {
        Self { registry, sink }
    }

    /// Drive playback until the release channel closes or shutdown fires.
    pub async fn run(
        self,
        mut releases: mpsc::Receiver<ReleasedTurn>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let released = tokio::select! {
                _ = shutdown.changed() => break,
                next = releases.recv() => match next {
                    Some(released) => released,
                    None => return,
                },
            };

            if !self.play_one(released, &mut shutdown).await {
                break;
            }
        }

        // Teardown: whatever is still queued will never play.
        while let Ok(released) = releases.try_recv() {
            let _ = self
                .registry
                .mark_failed(released.turn, FailureReason::SessionClosed);
        }
    }

    /// Play one released turn.  Returns `false` when shutdown interrupted
    /// the playback.
    async fn play_one(
        &self,
        released: ReleasedTurn,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let ReleasedTurn { turn, audio } = released;

        // A turn that failed between release and playback (teardown race)
        // bounces off this CAS and is skipped.
        if let Err(e) = self
            .registry
            .advance(turn, TurnState::Sequenced, TurnState::Playing, None)
        {
            log::debug!("gate: skipping {turn}: {e}");
            return true;
        }

        log::info!("gate: playing {turn} ({audio})");
        let result = tokio::select! {
            _ = shutdown.changed() => {
                // Cancelled mid-playback.  The sink future is dropped, which
                // stops delivery.
                let _ = self.registry.mark_failed(turn, FailureReason::SessionClosed);
                return false;
            }
            result = self.sink.play(turn, &audio) => result,
        };

        match result {
            Ok(()) => {
                if let Err(e) =
                    self.registry
                        .advance(turn, TurnState::Playing, TurnState::Done, None)
                {
                    log::debug!("gate: {turn} finished but moved on: {e}");
                }
            }
            Err(e) => {
                log::warn!("gate: playback of {turn} failed: {e}");
                let _ = self.registry.mark_failed(
                    turn,
                    FailureReason::Playback {
                        message: e.to_string(),
                    },
                );
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
