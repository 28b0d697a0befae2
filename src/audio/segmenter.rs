//! Utterance segmentation — energy-based VAD over per-speaker frame streams.
//!
//! [`Segmenter`] consumes labeled [`AudioFrame`]s and decides where one
//! utterance ends and the next begins.  Each speaker gets an independent
//! lane; lanes never interact.
//!
//! # Algorithm
//!
//! A frame is *voiced* when its RMS amplitude exceeds the configured
//! threshold.  A lane opens an utterance on the first voiced frame, keeps
//! buffering through interior silence, and finalizes once trailing silence
//! reaches the configured duration.  Utterances shorter than the minimum
//! speech duration are discarded — noise-triggered blips never become turns.
//!
//! ```text
//! ── silence ──▶ voiced: open utterance
//! ── voiced ──▶ keep buffering, fold interior silence in
//! ── silence ≥ trailing_silence_ms ──▶ finalize (or discard if too short)
//! ```
//!
//! The emitted [`UtteranceSegment`] carries an [`AudioHandle`] minted from
//! the speaker id and utterance start time; the raw samples stay with the
//! capture collaborator, which stores them under the same id.

use std::collections::HashMap;

use crate::audio::frame::{rms, AudioFrame, AudioHandle};
use crate::config::VadConfig;
use crate::turn::SpeakerId;

// ---------------------------------------------------------------------------
// UtteranceSegment
// ---------------------------------------------------------------------------

/// One finalized utterance, ready to become a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceSegment {
    pub speaker: SpeakerId,
    /// Reference to the stored utterance audio.
    pub handle: AudioHandle,
    /// Capture timestamp of the first voiced frame.
    pub started_at_ms: u64,
    /// Buffered speech length, interior silence included.
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Segmenter
// ---------------------------------------------------------------------------

/// Per-speaker utterance boundary detector.
///
/// Not thread-safe by itself — the pipeline runner owns one per session and
/// feeds it from the single event loop.
pub struct Segmenter {
    config: VadConfig,
    lanes: HashMap<SpeakerId, SpeakerLane>,
}

/// Silence/speech state for one speaker.
#[derive(Debug, Default)]
struct SpeakerLane {
    speaking: bool,
    /// Buffered utterance length in ms, interior silence folded in.
    buffered_ms: u64,
    /// Trailing silence accumulated since the last voiced frame.
    silence_ms: u64,
    /// Capture timestamp of the frame that opened the utterance.
    started_at_ms: u64,
}

impl Segmenter {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            lanes: HashMap::new(),
        }
    }

    /// Feed one frame; returns a finalized segment when this frame closed an
    /// utterance.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Option<UtteranceSegment> {
        let frame_ms = frame.duration_ms();
        if frame_ms == 0 {
            return None;
        }

        let voiced = rms(&frame.samples) > self.config.rms_threshold;
        let lane = self.lanes.entry(frame.speaker).or_default();

        if voiced {
            if !lane.speaking {
                log::debug!("segmenter: {} started speaking", frame.speaker);
                lane.speaking = true;
                lane.started_at_ms = frame.timestamp_ms;
                lane.buffered_ms = 0;
            }
            // Interior silence shorter than the trailing threshold belongs
            // to the utterance.
            lane.buffered_ms += lane.silence_ms + frame_ms;
            lane.silence_ms = 0;
            return None;
        }

        if !lane.speaking {
            return None;
        }

        lane.silence_ms += frame_ms;
        if lane.silence_ms < self.config.trailing_silence_ms {
            return None;
        }

        log::debug!("segmenter: {} went silent", frame.speaker);
        Self::finalize_lane(&self.config, frame.speaker, lane)
    }

    /// Flush one speaker's in-progress utterance, e.g. when the speaker
    /// disconnects mid-sentence.  The minimum-duration rule still applies.
    pub fn flush(&mut self, speaker: SpeakerId) -> Option<UtteranceSegment> {
        let lane = self.lanes.get_mut(&speaker)?;
        if !lane.speaking {
            return None;
        }
        Self::finalize_lane(&self.config, speaker, lane)
    }

    /// Flush every in-progress utterance — session teardown.  Segments are
    /// returned in speaker order for determinism.
    pub fn flush_all(&mut self) -> Vec<UtteranceSegment> {
        let mut speakers: Vec<SpeakerId> = self.lanes.keys().copied().collect();
        speakers.sort_unstable();
        speakers
            .into_iter()
            .filter_map(|speaker| self.flush(speaker))
            .collect()
    }

    fn finalize_lane(
        config: &VadConfig,
        speaker: SpeakerId,
        lane: &mut SpeakerLane,
    ) -> Option<UtteranceSegment> {
        let buffered_ms = lane.buffered_ms;
        let started_at_ms = lane.started_at_ms;
        *lane = SpeakerLane::default();

        if buffered_ms < config.min_speech_ms {
            log::debug!(
                "segmenter: discarding short utterance from {speaker} ({buffered_ms} ms < {} ms)",
                config.min_speech_ms
            );
            return None;
        }

        let handle = AudioHandle::new(
            format!("user_{}_{}", speaker.0, started_at_ms),
            buffered_ms,
        );
        log::info!("segmenter: utterance from {speaker}: {handle}");
        Some(UtteranceSegment {
            speaker,
            handle,
            started_at_ms,
            duration_ms: buffered_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
