//! The per-session event loop.
//!
//! `PipelineRunner` turns the stream of [`PipelineEvent`]s into registry
//! transitions and dispatcher submissions:
//!
//! * frames go through the segmenter; a finalized utterance becomes a turn
//!   and is submitted for transcription,
//! * stage completions advance the turn and submit the next stage,
//! * synthesized turns go through the sequencer and out to the playback
//!   gate in submission order,
//! * failures consume their sequence slot so the line keeps moving.
//!
//! Stale and duplicate deliveries bounce off the registry and are logged at
//! `debug!`; nothing here panics on a race.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::audio::{AudioFrame, Segmenter, UtteranceSegment};
use crate::config::PipelineConfig;
use crate::pipeline::PipelineEvent;
use crate::playback::{ReleasedTurn, Sequencer};
use crate::stage::{Stage, StageClients, StageDispatcher, StagePayload};
use crate::turn::{
    FailureReason, RegistryError, SessionId, SpeakerId, Turn, TurnId, TurnRegistry, TurnState,
};

/// Orchestrates one session from audio frame to ordered release.
pub struct PipelineRunner {
    session: SessionId,
    registry: Arc<TurnRegistry>,
    dispatcher: StageDispatcher,
    segmenter: Segmenter,
    sequencer: Sequencer,
    releases: mpsc::Sender<ReleasedTurn>,
    max_concurrent_turns: usize,
    /// Next session-wide sequence number, allocated per created turn.
    next_global_seq: u64,
    /// Next per-speaker sequence number, part of the turn id.
    speaker_seqs: HashMap<SpeakerId, u64>,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        registry: Arc<TurnRegistry>,
        clients: StageClients,
        config: &PipelineConfig,
        events: mpsc::Sender<PipelineEvent>,
        releases: mpsc::Sender<ReleasedTurn>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let dispatcher = StageDispatcher::new(
            Arc::clone(&registry),
            clients,
            config.stages.clone(),
            events,
            shutdown,
        );
        Self {
            session,
            registry,
            dispatcher,
            segmenter: Segmenter::new(config.vad.clone()),
            sequencer: Sequencer::new(),
            releases,
            max_concurrent_turns: config.session.max_concurrent_turns,
            next_global_seq: 0,
            speaker_seqs: HashMap::new(),
        }
    }

    /// Drive the session until shutdown fires or the event channel closes.
    /// Consumes the runner; teardown runs exactly once on the way out.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PipelineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("runner: session {} started", self.session);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        self.teardown();
        log::info!("runner: session {} stopped", self.session);
    }

    async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Frame(frame) => self.handle_frame(frame),
            PipelineEvent::StageCompleted {
                turn,
                stage,
                payload,
            } => self.handle_completed(turn, stage, payload).await,
            PipelineEvent::StageFailed { turn, reason, .. } => {
                self.handle_failed(turn, reason).await
            }
        }
    }

    // -- frames -------------------------------------------------------------

    fn handle_frame(&mut self, frame: AudioFrame) {
        if let Some(segment) = self.segmenter.push_frame(&frame) {
            self.open_turn(segment);
        }
    }

    /// Turn a finalized utterance into a turn and submit it for
    /// transcription.
    fn open_turn(&mut self, segment: UtteranceSegment) {
        let active = self.registry.active_count(self.session);
        if active >= self.max_concurrent_turns {
            log::warn!(
                "runner: {} at capacity ({active} active), dropping utterance from {}",
                self.session,
                segment.speaker
            );
            return;
        }

        let Some(id) = self.create_turn(&segment) else {
            return;
        };
        let payload = StagePayload::Audio(segment.handle);
        if let Err(e) = self.dispatcher.submit(id, Stage::Transcribe, payload) {
            log::error!("runner: failed to dispatch {id}: {e}");
        }
    }

    /// Register a turn for `segment`, allocating its per-speaker and
    /// session-wide sequence numbers.  Counters only move on success.
    fn create_turn(&mut self, segment: &UtteranceSegment) -> Option<TurnId> {
        let speaker_seq = self.speaker_seqs.entry(segment.speaker).or_insert(0);
        let id = TurnId::new(self.session, segment.speaker, *speaker_seq);

        match self
            .registry
            .create_turn(id, self.next_global_seq, segment.handle.clone())
        {
            Ok(id) => {
                *speaker_seq += 1;
                self.next_global_seq += 1;
                log::info!("runner: opened {id} ({})", segment.handle);
                Some(id)
            }
            Err(e) => {
                log::error!("runner: cannot open turn for {}: {e}", segment.speaker);
                None
            }
        }
    }

    // -- stage results ------------------------------------------------------

    async fn handle_completed(&mut self, id: TurnId, stage: Stage, payload: StagePayload) {
        let turn = match self.registry.advance(
            id,
            stage.dispatched_state(),
            stage.completed_state(),
            Some(payload),
        ) {
            Ok(turn) => turn,
            // A duplicate or late result for a turn that already moved on.
            Err(e @ RegistryError::StaleTransition { .. }) => {
                log::debug!("runner: discarding stale {stage} result for {id}: {e}");
                return;
            }
            // Anything else (a payload kind that does not fit the target
            // state, a vanished turn) means the result is unusable.  The
            // turn must still terminate so its sequence slot is consumed
            // and later turns keep flowing.
            Err(e) => {
                log::error!("runner: cannot apply {stage} result for {id}: {e}");
                let attempts = self
                    .registry
                    .get(id)
                    .map(|t| t.retries(stage) + 1)
                    .unwrap_or(1);
                self.fail_turn(
                    id,
                    FailureReason::Stage {
                        stage,
                        attempts,
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        match stage {
            Stage::Transcribe => {
                let Some(transcript) = turn.transcript else {
                    return;
                };
                log::info!("runner: {id} transcribed: {transcript:?}");
                self.submit_next(id, Stage::Generate, StagePayload::Text(transcript));
            }
            Stage::Generate => {
                let Some(reply) = turn.reply else {
                    return;
                };
                log::info!("runner: {id} reply generated ({} chars)", reply.len());
                self.submit_next(id, Stage::Synthesize, StagePayload::Text(reply));
            }
            Stage::Synthesize => {
                log::info!("runner: {id} synthesized, queueing for release");
                let released = self.sequencer.offer(turn.global_seq, id);
                self.forward_released(released).await;
            }
        }
    }

    fn submit_next(&mut self, id: TurnId, stage: Stage, payload: StagePayload) {
        if let Err(e) = self.dispatcher.submit(id, stage, payload) {
            log::error!("runner: failed to dispatch {stage} for {id}: {e}");
        }
    }

    async fn handle_failed(&mut self, id: TurnId, reason: FailureReason) {
        self.fail_turn(id, reason).await;
    }

    /// Terminate a turn and consume its sequence slot so later turns are
    /// not blocked behind it.
    async fn fail_turn(&mut self, id: TurnId, reason: FailureReason) {
        let turn = match self.registry.mark_failed(id, reason) {
            Ok(turn) => turn,
            // Already terminal (e.g. teardown raced the dispatcher).
            Err(e) => {
                log::debug!("runner: ignoring failure for {id}: {e}");
                return;
            }
        };

        let released = self.sequencer.mark_failed(turn.global_seq);
        self.forward_released(released).await;
    }

    /// Move released turns to `Sequenced` and hand them to the playback
    /// gate, preserving order.
    async fn forward_released(&mut self, released: Vec<TurnId>) {
        for id in released {
            let turn = match self
                .registry
                .advance(id, TurnState::Synthesized, TurnState::Sequenced, None)
            {
                Ok(turn) => turn,
                Err(e) => {
                    log::debug!("runner: cannot sequence {id}: {e}");
                    continue;
                }
            };
            let Some(audio) = turn.synthesized else {
                continue;
            };
            if self
                .releases
                .send(ReleasedTurn { turn: id, audio })
                .await
                .is_err()
            {
                log::debug!("runner: release channel closed, dropping {id}");
            }
        }
    }

    // -- teardown -----------------------------------------------------------

    /// Fail everything still in flight.  In-progress utterances are flushed
    /// into turns first so the record shows they existed.
    fn teardown(&mut self) {
        for segment in self.segmenter.flush_all() {
            if let Some(id) = self.create_turn(&segment) {
                let _ = self.registry.mark_failed(id, FailureReason::SessionClosed);
            }
        }

        for id in self.sequencer.pending() {
            let _ = self.registry.mark_failed(id, FailureReason::SessionClosed);
        }

        let stragglers: Vec<Turn> = self
            .registry
            .session_turns(self.session)
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .collect();
        for turn in stragglers {
            log::debug!("runner: failing straggler {} in {}", turn.id, turn.state);
            let _ = self
                .registry
                .mark_failed(turn.id, FailureReason::SessionClosed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
