//! Configuration module for the voice pipeline.
//!
//! Provides `PipelineConfig` (top-level settings), sub-configs for each
//! subsystem, `AppPaths` for cross-platform data directories, and TOML
//! persistence via `PipelineConfig::load` / `PipelineConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{PipelineConfig, SessionConfig, StageConfig, StagesConfig, VadConfig};
