//! EOG wearable protocol: line codec, phase machine, async engine.

pub mod codec;
pub mod engine;
pub mod phase;

pub use codec::{BlinkFlag, Command, MinuteSample};
pub use engine::{EogConfig, EogEngine, EogSnapshot};
pub use phase::{CalibrationStage, ProtocolPhase};
