//! Pipeline settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

use super::AppPaths;

// ---------------------------------------------------------------------------
// StageConfig
// ---------------------------------------------------------------------------

/// Settings for one remote stage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// HTTP endpoint the stage request is POSTed to.
    pub endpoint: String,
    /// Bearer token — `None` for services that require no authentication.
    pub api_key: Option<String>,
    /// Maximum seconds to wait for one attempt before it counts as a
    /// timeout.
    pub timeout_secs: u64,
    /// Total attempts per turn and stage, the first try included.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `backoff_base_ms × 2^n`, capped below.
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl StageConfig {
    fn with_defaults(endpoint: &str, timeout_secs: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
        }
    }
}

// ---------------------------------------------------------------------------
// StagesConfig
// ---------------------------------------------------------------------------

/// Per-stage endpoint, timeout and retry settings.
///
/// Generation gets the long default timeout — LLM latency is the pipeline's
/// long pole; transcription and synthesis answer much faster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    pub transcribe: StageConfig,
    pub generate: StageConfig,
    pub synthesize: StageConfig,
}

impl StagesConfig {
    /// Settings for `stage`.
    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Transcribe => &self.transcribe,
            Stage::Generate => &self.generate,
            Stage::Synthesize => &self.synthesize,
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            transcribe: StageConfig::with_defaults("http://localhost:8801/transcribe", 10),
            generate: StageConfig::with_defaults("http://localhost:8802/generate", 30),
            synthesize: StageConfig::with_defaults("http://localhost:8803/synthesize", 10),
        }
    }
}

// ---------------------------------------------------------------------------
// VadConfig
// ---------------------------------------------------------------------------

/// Voice-activity thresholds for the segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS amplitude threshold; frames below this are considered silence.
    /// A typical value is `0.01` for quiet channels; use `0.02`–`0.05` for
    /// noisy ones.
    pub rms_threshold: f32,
    /// Speech shorter than this is discarded as noise, no turn created.
    pub min_speech_ms: u64,
    /// Silence of this length after speech ends the utterance.
    pub trailing_silence_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 0.01,
            min_speech_ms: 200,
            trailing_silence_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum turns in flight per session.  Segments arriving above the
    /// cap are dropped before a turn is created.
    pub max_concurrent_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_turns: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level pipeline configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_pipeline::config::PipelineConfig;
///
/// // Load (returns Default when file is missing)
/// let config = PipelineConfig::load().unwrap();
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Remote stage endpoints and retry budgets.
    pub stages: StagesConfig,
    /// Segmenter thresholds.
    pub vad: VadConfig,
    /// Per-session limits.
    pub session: SessionConfig,
}

impl PipelineConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(PipelineConfig::default())` when the file does not exist
    /// yet (first-run scenario) so callers never need to special-case a
    /// missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_design() {
        let cfg = PipelineConfig::default();

        // Generation is the long pole.
        assert_eq!(cfg.stages.transcribe.timeout_secs, 10);
        assert_eq!(cfg.stages.generate.timeout_secs, 30);
        assert_eq!(cfg.stages.synthesize.timeout_secs, 10);

        for stage in Stage::ALL {
            let sc = cfg.stages.stage(stage);
            assert_eq!(sc.max_attempts, 3);
            assert_eq!(sc.backoff_base_ms, 500);
            assert_eq!(sc.backoff_cap_ms, 8_000);
            assert!(sc.api_key.is_none());
        }

        assert!((cfg.vad.rms_threshold - 0.01).abs() < 1e-7);
        assert_eq!(cfg.vad.min_speech_ms, 200);
        assert_eq!(cfg.vad.trailing_silence_ms, 500);
        assert_eq!(cfg.session.max_concurrent_turns, 8);
    }

    #[test]
    fn stage_accessor_maps_correctly() {
        let cfg = StagesConfig::default();
        assert!(cfg.stage(Stage::Transcribe).endpoint.contains("transcribe"));
        assert!(cfg.stage(Stage::Generate).endpoint.contains("generate"));
        assert!(cfg.stage(Stage::Synthesize).endpoint.contains("synthesize"));
    }

    /// Verify that a default config can be serialised to TOML and
    /// deserialised back without any data loss.
    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = PipelineConfig::default();
        original.save_to(&path).expect("save");
        let loaded = PipelineConfig::load_from(&path).expect("load");

        assert_eq!(
            original.stages.generate.endpoint,
            loaded.stages.generate.endpoint
        );
        assert_eq!(
            original.stages.generate.timeout_secs,
            loaded.stages.generate.timeout_secs
        );
        assert_eq!(original.vad.min_speech_ms, loaded.vad.min_speech_ms);
        assert_eq!(
            original.session.max_concurrent_turns,
            loaded.session.max_concurrent_turns
        );
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = PipelineConfig::load_from(&path).expect("should not error");
        assert_eq!(config.session.max_concurrent_turns, 8);
        assert_eq!(config.stages.generate.timeout_secs, 30);
    }

    /// Verify that modified non-default values survive a round trip.
    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = PipelineConfig::default();
        cfg.stages.transcribe.endpoint = "http://asr.internal:9000/v1".into();
        cfg.stages.transcribe.api_key = Some("sk-test".into());
        cfg.stages.generate.max_attempts = 5;
        cfg.vad.trailing_silence_ms = 800;
        cfg.session.max_concurrent_turns = 2;

        cfg.save_to(&path).expect("save");
        let loaded = PipelineConfig::load_from(&path).expect("load");

        assert_eq!(
            loaded.stages.transcribe.endpoint,
            "http://asr.internal:9000/v1"
        );
        assert_eq!(loaded.stages.transcribe.api_key, Some("sk-test".into()));
        assert_eq!(loaded.stages.generate.max_attempts, 5);
        assert_eq!(loaded.vad.trailing_silence_ms, 800);
        assert_eq!(loaded.session.max_concurrent_turns, 2);
    }
}
