//! Turn orchestration for multi-speaker voice sessions.
//!
//! Labeled audio frames come in from a capture boundary; ordered, serialized
//! reply audio goes out to a playback boundary.  In between, each detected
//! utterance becomes a **turn** that moves through three remote stages:
//!
//! ```text
//! frames → Segmenter → TurnRegistry → transcribe → generate → synthesize
//!                                            │
//!                        Sequencer (submission order) → PlaybackGate → sink
//! ```
//!
//! The remote stages run on separate machines behind an at-least-once
//! transport; correlation ids plus the registry's compare-and-set
//! transitions keep duplicated, reordered, and late responses from
//! corrupting turn state.
//!
//! Start with [`session::SessionManager`]: it wires a [`pipeline::PipelineRunner`]
//! and [`playback::PlaybackGate`] per session over a shared
//! [`turn::TurnRegistry`].

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod playback;
pub mod session;
pub mod stage;
pub mod turn;
