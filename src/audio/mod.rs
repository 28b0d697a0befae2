//! Audio boundary — labeled frames in, utterance segments out.
//!
//! # Pipeline
//!
//! ```text
//! capture collaborator → AudioFrame (per speaker) → Segmenter (energy VAD)
//!                      → UtteranceSegment { AudioHandle } → turn creation
//! ```
//!
//! The core never stores or forwards raw samples beyond the segmenter's
//! energy measurement; utterance and synthesis audio travel as
//! [`AudioHandle`] references resolved by the capture/synthesis
//! collaborators.

pub mod frame;
pub mod segmenter;

pub use frame::{rms, AudioFrame, AudioHandle, SAMPLE_RATE};
pub use segmenter::{Segmenter, UtteranceSegment};
