//! Stage dispatcher — timeout, retry with backoff, and stale-result defense.
//!
//! [`StageDispatcher::submit`] moves a turn into the stage's dispatched
//! state and spawns one task that drives the remote call to completion or
//! exhaustion.  The submit-time compare-and-set doubles as the guarantee
//! that at most one request per (turn, stage) is ever outstanding: a second
//! submit bounces off the CAS.
//!
//! # Retry discipline
//!
//! ```text
//! attempt 0 ──timeout/error──▶ sleep base×2^0 ──▶ record_retry ──▶ attempt 1
//! attempt 1 ──timeout/error──▶ sleep base×2^1 ──▶ record_retry ──▶ attempt 2
//! ...
//! attempt max_attempts-1 ──timeout/error──▶ StageFailed (exactly once)
//! ```
//!
//! `record_retry` is itself a CAS against the dispatched state.  If the turn
//! has already moved on — a slow first attempt lost the race against its own
//! retry, or the session tore the turn down — the retry is abandoned
//! silently and no event is emitted.  A late response can therefore never
//! corrupt turn state: its correlation id no longer matches in the client,
//! and its transition would be stale in the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::{StageConfig, StagesConfig};
use crate::pipeline::PipelineEvent;
use crate::stage::{CorrelationId, Stage, StageClient, StagePayload, StageRequest};
use crate::turn::{FailureReason, RegistryError, TurnId, TurnRegistry};

// ---------------------------------------------------------------------------
// StageClients
// ---------------------------------------------------------------------------

/// One transport client per stage.  Cheap to clone (`Arc`s).
#[derive(Clone)]
pub struct StageClients {
    pub transcribe: Arc<dyn StageClient>,
    pub generate: Arc<dyn StageClient>,
    pub synthesize: Arc<dyn StageClient>,
}

impl StageClients {
    pub fn client(&self, stage: Stage) -> Arc<dyn StageClient> {
        match stage {
            Stage::Transcribe => Arc::clone(&self.transcribe),
            Stage::Generate => Arc::clone(&self.generate),
            Stage::Synthesize => Arc::clone(&self.synthesize),
        }
    }
}

// ---------------------------------------------------------------------------
// StageDispatcher
// ---------------------------------------------------------------------------

/// Hands turn payloads to remote stages and reports outcomes as
/// [`PipelineEvent`]s, independent of submission order.
pub struct StageDispatcher {
    registry: Arc<TurnRegistry>,
    clients: StageClients,
    config: StagesConfig,
    events: mpsc::Sender<PipelineEvent>,
    shutdown: watch::Receiver<bool>,
}

impl StageDispatcher {
    pub fn new(
        registry: Arc<TurnRegistry>,
        clients: StageClients,
        config: StagesConfig,
        events: mpsc::Sender<PipelineEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            clients,
            config,
            events,
            shutdown,
        }
    }

    /// Dispatch `payload` to `stage` for `turn`.
    ///
    /// Advances the turn `ready → dispatched` first; the CAS rejects a
    /// duplicate submit (`StaleTransition`) so two concurrent requests for
    /// the same (turn, stage) pair cannot exist.
    pub fn submit(
        &self,
        turn: TurnId,
        stage: Stage,
        payload: StagePayload,
    ) -> Result<(), RegistryError> {
        self.registry
            .advance(turn, stage.ready_state(), stage.dispatched_state(), None)?;

        let task = DispatchTask {
            registry: Arc::clone(&self.registry),
            client: self.clients.client(stage),
            config: self.config.stage(stage).clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            turn,
            stage,
            payload,
        };
        tokio::spawn(task.run());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DispatchTask
// ---------------------------------------------------------------------------

/// One in-flight (turn, stage) request, with its retry loop.
struct DispatchTask {
    registry: Arc<TurnRegistry>,
    client: Arc<dyn StageClient>,
    config: StageConfig,
    events: mpsc::Sender<PipelineEvent>,
    shutdown: watch::Receiver<bool>,
    turn: TurnId,
    stage: Stage,
    payload: StagePayload,
}

impl DispatchTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                log::debug!("dispatch: {}/{} cancelled by teardown", self.turn, self.stage);
                return;
            }

            let correlation_id = CorrelationId::new(self.turn, self.stage, attempt);
            let request = StageRequest {
                correlation_id,
                turn_id: self.turn,
                stage: self.stage,
                payload: self.payload.clone(),
                timeout_secs: self.config.timeout_secs,
            };
            log::debug!("dispatch: {correlation_id} -> {}", self.config.endpoint);

            let outcome = tokio::select! {
                _ = self.shutdown.changed() => {
                    log::debug!("dispatch: {correlation_id} cancelled mid-flight");
                    return;
                }
                result = tokio::time::timeout(
                    Duration::from_secs(self.config.timeout_secs),
                    self.client.call(request),
                ) => result,
            };

            let error = match outcome {
                Ok(Ok(result)) => {
                    log::debug!("dispatch: {correlation_id} completed");
                    let _ = self
                        .events
                        .send(PipelineEvent::StageCompleted {
                            turn: self.turn,
                            stage: self.stage,
                            payload: result,
                        })
                        .await;
                    return;
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => crate::stage::StageError::Timeout,
            };

            let attempts_used = attempt + 1;
            if attempts_used >= self.config.max_attempts {
                log::warn!(
                    "dispatch: {correlation_id} exhausted {attempts_used} attempts: {error}"
                );
                let _ = self
                    .events
                    .send(PipelineEvent::StageFailed {
                        turn: self.turn,
                        stage: self.stage,
                        reason: FailureReason::Stage {
                            stage: self.stage,
                            attempts: attempts_used,
                            message: error.to_string(),
                        },
                    })
                    .await;
                return;
            }

            let delay = backoff_delay(self.config.backoff_base_ms, attempt, self.config.backoff_cap_ms);
            log::debug!("dispatch: {correlation_id} failed ({error}), retrying in {delay:?}");
            tokio::select! {
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.registry.record_retry(self.turn, self.stage) {
                Ok(count) => attempt = count,
                Err(e) => {
                    // The turn moved on while we were backing off — a late
                    // success or a teardown won the race.  Abandon quietly.
                    log::debug!("dispatch: {correlation_id} retry abandoned: {e}");
                    return;
                }
            }
        }
    }
}

/// Exponential backoff: `base × 2^attempt`, capped.
fn backoff_delay(base_ms: u64, attempt: u32, cap_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
