//! Session lifecycle — one runner and one playback gate per voice channel.
//!
//! [`SessionManager`] owns the long-lived pieces (registry, stage clients,
//! audio sink, config) and wires up the per-session tasks on
//! [`SessionManager::open_session`]:
//!
//! ```text
//! SessionHandle ─frames─▶ PipelineRunner ─releases─▶ PlaybackGate ─▶ AudioSink
//!                              │
//!                     StageDispatcher tasks
//! ```
//!
//! All tasks of one session share a `watch` shutdown signal;
//! [`SessionManager::close_session`] flips it, waits for both tasks to drain
//! and drops the session's turns from the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::AudioFrame;
use crate::config::PipelineConfig;
use crate::pipeline::{PipelineEvent, PipelineRunner};
use crate::playback::{AudioSink, PlaybackGate};
use crate::stage::StageClients;
use crate::turn::{SessionId, TurnRegistry};

/// Event queue depth per session; frames arrive at 50/s per speaker.
const EVENT_QUEUE_DEPTH: usize = 1024;
const RELEASE_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} is already open")]
    DuplicateSession(SessionId),

    #[error("session {0} is not open")]
    UnknownSession(SessionId),

    #[error("session {0} is shutting down")]
    SessionClosed(SessionId),
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// The capture boundary's way into one session.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: SessionId,
    events: mpsc::Sender<PipelineEvent>,
}

impl SessionHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Feed one labeled audio frame into the session's pipeline.
    pub async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError> {
        self.events
            .send(PipelineEvent::Frame(frame))
            .await
            .map_err(|_| SessionError::SessionClosed(self.session))
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

struct SessionEntry {
    shutdown: watch::Sender<bool>,
    runner: JoinHandle<()>,
    gate: JoinHandle<()>,
}

/// Creates and tears down sessions; everything between happens in the
/// session's own tasks.
pub struct SessionManager {
    registry: Arc<TurnRegistry>,
    clients: StageClients,
    sink: Arc<dyn AudioSink>,
    config: PipelineConfig,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionManager {
    pub fn new(clients: StageClients, sink: Arc<dyn AudioSink>, config: PipelineConfig) -> Self {
        Self {
            registry: Arc::new(TurnRegistry::new()),
            clients,
            sink,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The shared turn registry, for inspection and tests.
    pub fn registry(&self) -> Arc<TurnRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Spawn the runner and playback gate for a new session.
    pub fn open_session(&self, session: SessionId) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session) {
            return Err(SessionError::DuplicateSession(session));
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (release_tx, release_rx) = mpsc::channel(RELEASE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = PipelineRunner::new(
            session,
            Arc::clone(&self.registry),
            self.clients.clone(),
            &self.config,
            event_tx.clone(),
            release_tx,
            shutdown_rx.clone(),
        );
        let gate = PlaybackGate::new(Arc::clone(&self.registry), Arc::clone(&self.sink));

        let runner = tokio::spawn(runner.run(event_rx, shutdown_rx.clone()));
        let gate = tokio::spawn(gate.run(release_rx, shutdown_rx));

        sessions.insert(
            session,
            SessionEntry {
                shutdown: shutdown_tx,
                runner,
                gate,
            },
        );
        log::info!("session {session} opened");
        Ok(SessionHandle {
            session,
            events: event_tx,
        })
    }

    /// Tear a session down: signal shutdown, wait for the runner and gate to
    /// finish failing the stragglers, then drop the session's turns.
    pub async fn close_session(&self, session: SessionId) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session)
            .ok_or(SessionError::UnknownSession(session))?;

        let _ = entry.shutdown.send(true);
        let _ = entry.runner.await;
        let _ = entry.gate.await;

        self.registry.remove_session(session);
        log::info!("session {session} closed");
        Ok(())
    }

    /// Close every open session, e.g. on process shutdown.
    pub async fn close_all(&self) {
        let open: Vec<SessionId> = self.sessions.lock().unwrap().keys().copied().collect();
        for session in open {
            let _ = self.close_session(session).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioHandle;
    use crate::playback::PlaybackError;
    use crate::stage::{MockStageClient, StagePayload};
    use crate::turn::{SpeakerId, TurnId, TurnState};
    use async_trait::async_trait;
    use std::time::Duration;

    const FRAME_MS: u64 = 20;
    const FRAME_SAMPLES: usize = 320;

    struct RecordingSink {
        played: Mutex<Vec<TurnId>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                played: Mutex::new(Vec::new()),
            }
        }

        fn played(&self) -> Vec<TurnId> {
            self.played.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, turn: TurnId, _audio: &AudioHandle) -> Result<(), PlaybackError> {
            self.played.lock().unwrap().push(turn);
            Ok(())
        }
    }

    fn manager_with_sink() -> (SessionManager, Arc<RecordingSink>) {
        let clients = StageClients {
            transcribe: Arc::new(MockStageClient::ok(StagePayload::Text("hello".into()))),
            generate: Arc::new(MockStageClient::ok(StagePayload::Text("hi!".into()))),
            synthesize: Arc::new(MockStageClient::ok(StagePayload::Audio(AudioHandle::new(
                "tts_reply",
                800,
            )))),
        };
        let sink = Arc::new(RecordingSink::new());
        let manager = SessionManager::new(clients, sink.clone(), PipelineConfig::default());
        (manager, sink)
    }

    async fn speak(handle: &SessionHandle, speaker: u64, start_ms: u64) {
        let mut t = start_ms;
        for _ in 0..20 {
            let frame = AudioFrame {
                speaker: SpeakerId(speaker),
                timestamp_ms: t,
                samples: vec![0.5; FRAME_SAMPLES],
            };
            handle.push_frame(frame).await.unwrap();
            t += FRAME_MS;
        }
        for _ in 0..25 {
            let frame = AudioFrame {
                speaker: SpeakerId(speaker),
                timestamp_ms: t,
                samples: vec![0.0; FRAME_SAMPLES],
            };
            handle.push_frame(frame).await.unwrap();
            t += FRAME_MS;
        }
    }

    #[tokio::test]
    async fn utterance_plays_end_to_end() {
        let (manager, sink) = manager_with_sink();
        let session = SessionId(1);
        let handle = manager.open_session(session).unwrap();

        speak(&handle, 42, 0).await;

        // Mocked stages answer immediately; wait for playback to land.
        let expected = TurnId::new(session, SpeakerId(42), 0);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.played().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no playback within 2s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.played(), vec![expected]);

        let turn = manager.registry().get(expected).unwrap();
        assert_eq!(turn.state, TurnState::Done);
        assert_eq!(turn.transcript.as_deref(), Some("hello"));
        assert_eq!(turn.reply.as_deref(), Some("hi!"));
        assert_eq!(turn.synthesized.as_ref().unwrap().id, "tts_reply");

        manager.close_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_open_is_rejected() {
        let (manager, _sink) = manager_with_sink();
        let session = SessionId(1);
        let _handle = manager.open_session(session).unwrap();

        assert_eq!(
            manager.open_session(session).unwrap_err(),
            SessionError::DuplicateSession(session)
        );
        assert_eq!(manager.open_sessions(), 1);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn close_unknown_session_errors() {
        let (manager, _sink) = manager_with_sink();
        assert_eq!(
            manager.close_session(SessionId(9)).await.unwrap_err(),
            SessionError::UnknownSession(SessionId(9))
        );
    }

    #[tokio::test]
    async fn close_drops_turns_and_rejects_frames() {
        let (manager, sink) = manager_with_sink();
        let session = SessionId(1);
        let handle = manager.open_session(session).unwrap();

        speak(&handle, 1, 0).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.played().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no playback within 2s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.close_session(session).await.unwrap();
        assert_eq!(manager.open_sessions(), 0);
        assert!(manager
            .registry()
            .get(TurnId::new(session, SpeakerId(1), 0))
            .is_none());

        let frame = AudioFrame {
            speaker: SpeakerId(1),
            timestamp_ms: 0,
            samples: vec![0.5; FRAME_SAMPLES],
        };
        assert_eq!(
            handle.push_frame(frame).await.unwrap_err(),
            SessionError::SessionClosed(session)
        );
    }

    #[tokio::test]
    async fn sessions_do_not_interfere() {
        let (manager, sink) = manager_with_sink();
        let a = manager.open_session(SessionId(1)).unwrap();
        let b = manager.open_session(SessionId(2)).unwrap();

        speak(&a, 1, 0).await;
        speak(&b, 1, 0).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.played().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "both sessions play");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.close_session(SessionId(1)).await.unwrap();
        // Session 2's turn is untouched by session 1's teardown.
        let b_turn = TurnId::new(SessionId(2), SpeakerId(1), 0);
        assert_eq!(manager.registry().get(b_turn).unwrap().state, TurnState::Done);
        manager.close_all().await;
    }
}
