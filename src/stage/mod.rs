//! Remote stage identity, wire format, and dispatch.
//!
//! A **stage** is one of the three external, swappable processing steps —
//! transcription (ASR), generation (LLM), synthesis (TTS).  Each runs on its
//! own machine behind an HTTP endpoint; the orchestrator only ever sees the
//! request/response envelope defined here.
//!
//! ```text
//! StageRequest  = { correlation_id, turn_id, stage, payload, timeout_secs }
//! StageResponse = { correlation_id, status (ok|error), payload | error }
//! ```
//!
//! Transport is at-least-once with possible duplication and reordering.  The
//! sole defense is the [`CorrelationId`] plus the registry's state-guarded
//! transitions: a late or duplicate response either fails the correlation
//! check in the client or bounces off the compare-and-set as a
//! `StaleTransition`.

pub mod client;
pub mod dispatcher;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::AudioHandle;
use crate::turn::TurnId;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use client::{HttpStageClient, StageClient};
pub use dispatcher::{StageClients, StageDispatcher};

#[cfg(test)]
pub use client::{MockStageClient, PendingStageClient};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// The three remote processing steps, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Speech → text (ASR).
    Transcribe,
    /// Text → reply text (LLM).
    Generate,
    /// Reply text → audio (TTS).
    Synthesize,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Transcribe, Stage::Generate, Stage::Synthesize];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Transcribe => "transcribe",
            Stage::Generate => "generate",
            Stage::Synthesize => "synthesize",
        }
    }

    /// Dense index for per-stage counters.
    pub fn index(self) -> usize {
        match self {
            Stage::Transcribe => 0,
            Stage::Generate => 1,
            Stage::Synthesize => 2,
        }
    }

    /// The turn state a turn must be in before this stage can be dispatched.
    pub fn ready_state(self) -> crate::turn::TurnState {
        use crate::turn::TurnState::*;
        match self {
            Stage::Transcribe => Segmented,
            Stage::Generate => Transcribed,
            Stage::Synthesize => Generated,
        }
    }

    /// The turn state while this stage's request is in flight.
    pub fn dispatched_state(self) -> crate::turn::TurnState {
        use crate::turn::TurnState::*;
        match self {
            Stage::Transcribe => TranscribeDispatched,
            Stage::Generate => GenerateDispatched,
            Stage::Synthesize => SynthesizeDispatched,
        }
    }

    /// The turn state once this stage's result has been applied.
    pub fn completed_state(self) -> crate::turn::TurnState {
        use crate::turn::TurnState::*;
        match self {
            Stage::Transcribe => Transcribed,
            Stage::Generate => Generated,
            Stage::Synthesize => Synthesized,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CorrelationId
// ---------------------------------------------------------------------------

/// Binds a dispatched request to its eventual response.
///
/// The attempt number makes every retry a distinct correlation, so a slow
/// first attempt can never be mistaken for the answer to its own retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub turn: TurnId,
    pub stage: Stage,
    pub attempt: u32,
}

impl CorrelationId {
    pub fn new(turn: TurnId, stage: Stage, attempt: u32) -> Self {
        Self {
            turn,
            stage,
            attempt,
        }
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.turn, self.stage, self.attempt)
    }
}

// ---------------------------------------------------------------------------
// Payloads and envelopes
// ---------------------------------------------------------------------------

/// What a stage consumes or produces: an audio reference or text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StagePayload {
    Audio(AudioHandle),
    Text(String),
}

/// Request envelope POSTed to a stage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub correlation_id: CorrelationId,
    pub turn_id: TurnId,
    pub stage: Stage,
    pub payload: StagePayload,
    /// Advisory deadline for the remote side.
    pub timeout_secs: u64,
}

/// Response status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Error,
}

/// Response envelope returned by a stage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResponse {
    pub correlation_id: CorrelationId,
    pub status: StageStatus,
    /// Result payload when `status == Ok`.
    #[serde(default)]
    pub payload: Option<StagePayload>,
    /// Error reason when `status == Error`.
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// Errors that can surface from one stage call attempt.
///
/// All variants are retryable from the dispatcher's point of view; the retry
/// budget, not the variant, decides when to give up.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The attempt did not complete within the configured timeout.
    #[error("stage request timed out")]
    Timeout,

    /// HTTP transport or connection error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote stage answered with `status = error`.
    #[error("remote stage error: {0}")]
    Remote(String),

    /// The response violated the envelope contract (bad JSON, wrong
    /// correlation id, missing payload).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for StageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StageError::Timeout
        } else {
            StageError::Transport(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{SessionId, SpeakerId};

    fn turn_id() -> TurnId {
        TurnId::new(SessionId(1), SpeakerId(2), 3)
    }

    #[test]
    fn correlation_id_display() {
        let corr = CorrelationId::new(turn_id(), Stage::Generate, 0);
        assert_eq!(corr.to_string(), "s1:u2:3/generate#0");
    }

    #[test]
    fn retries_produce_distinct_correlations() {
        let a = CorrelationId::new(turn_id(), Stage::Transcribe, 0);
        let b = CorrelationId::new(turn_id(), Stage::Transcribe, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn stage_state_mapping_is_consistent() {
        for stage in Stage::ALL {
            assert!(stage.ready_state().can_advance_to(stage.dispatched_state()));
            assert!(stage
                .dispatched_state()
                .can_advance_to(stage.completed_state()));
            assert_eq!(stage.dispatched_state().dispatched_stage(), Some(stage));
        }
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = StageRequest {
            correlation_id: CorrelationId::new(turn_id(), Stage::Transcribe, 1),
            turn_id: turn_id(),
            stage: Stage::Transcribe,
            payload: StagePayload::Audio(AudioHandle::new("user_2_100", 640)),
            timeout_secs: 10,
        };

        let json = serde_json::to_string(&request).unwrap();
        let back: StageRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(back.correlation_id, request.correlation_id);
        assert_eq!(back.payload, request.payload);
        assert_eq!(back.timeout_secs, 10);
    }

    #[test]
    fn ok_response_parses_with_payload() {
        let json = r#"{
            "correlation_id": { "turn": { "session": 1, "speaker": 2, "seq": 3 },
                                "stage": "transcribe", "attempt": 0 },
            "status": "ok",
            "payload": { "kind": "text", "value": "hello there" }
        }"#;

        let response: StageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, StageStatus::Ok);
        assert_eq!(
            response.payload,
            Some(StagePayload::Text("hello there".into()))
        );
        assert!(response.error.is_none());
    }

    #[test]
    fn error_response_parses_without_payload() {
        let json = r#"{
            "correlation_id": { "turn": { "session": 1, "speaker": 2, "seq": 3 },
                                "stage": "generate", "attempt": 2 },
            "status": "error",
            "error": "model overloaded"
        }"#;

        let response: StageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, StageStatus::Error);
        assert!(response.payload.is_none());
        assert_eq!(response.error.as_deref(), Some("model overloaded"));
    }

    #[test]
    fn stage_display_and_index() {
        assert_eq!(Stage::Transcribe.to_string(), "transcribe");
        assert_eq!(Stage::Synthesize.as_str(), "synthesize");
        let indices: Vec<usize> = Stage::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
