//! Service entry point — voice turn pipeline.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`PipelineConfig`] from disk (returns default on first run).
//! 3. Build one [`HttpStageClient`] per remote stage from config.
//! 4. Create the [`SessionManager`] over the stage clients and audio sink.
//! 5. Open the initial session; the capture boundary feeds frames through
//!    its [`SessionHandle`].
//! 6. Block on Ctrl-C, then close every session so in-flight turns are
//!    failed cleanly before exit.
//!
//! The capture and playback boundaries are deployment-specific; this binary
//! wires in a logging sink that paces itself by the synthesized duration,
//! which is enough to observe the pipeline end to end against real stage
//! services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use voice_pipeline::{
    audio::AudioHandle,
    config::PipelineConfig,
    playback::{AudioSink, PlaybackError},
    session::SessionManager,
    stage::{HttpStageClient, Stage, StageClients},
    turn::{SessionId, TurnId},
};

// ---------------------------------------------------------------------------
// Logging sink
// ---------------------------------------------------------------------------

/// Playback boundary stand-in: logs each released turn and holds the gate
/// for the audio's real duration, so serialization behaves as it would
/// against a live voice channel.
struct LoggingSink;

#[async_trait]
impl AudioSink for LoggingSink {
    async fn play(&self, turn: TurnId, audio: &AudioHandle) -> Result<(), PlaybackError> {
        log::info!("sink: playing {turn}: {audio}");
        tokio::time::sleep(Duration::from_millis(audio.duration_ms)).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice pipeline starting up");

    // 2. Config
    let config = PipelineConfig::load().unwrap_or_else(|e| {
        log::warn!("failed to load config, using defaults: {e}");
        PipelineConfig::default()
    });
    for stage in Stage::ALL {
        log::info!("stage {stage}: {}", config.stages.stage(stage).endpoint);
    }

    // 3. Stage clients
    let clients = StageClients {
        transcribe: Arc::new(HttpStageClient::from_config(&config.stages.transcribe)),
        generate: Arc::new(HttpStageClient::from_config(&config.stages.generate)),
        synthesize: Arc::new(HttpStageClient::from_config(&config.stages.synthesize)),
    };

    // 4. Session manager
    let manager = SessionManager::new(clients, Arc::new(LoggingSink), config);

    // 5. Initial session
    let handle = manager.open_session(SessionId(1))?;
    log::info!(
        "session {} open, waiting for frames from the capture boundary",
        handle.session()
    );

    // 6. Shutdown
    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    manager.close_all().await;
    Ok(())
}
