//! Camera eye-closure fusion: config composition, per-frame engine,
//! bounded-rate sampler.

pub mod config;
pub mod engine;
pub mod sampler;

pub use config::{effective_config, effective_delay_ms, EffectiveConfig};
pub use engine::{FaceFrame, FrameVerdict, FusionEngine, FusionSnapshot};
pub use sampler::{FrameSource, FusionConfig, FusionController};
