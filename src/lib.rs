//! Driver-fatigue detection core.
//!
//! Fuses two independent sensing channels, a phone camera's eye-openness
//! estimate and an EOG wearable's blink classifier, into drowsiness
//! verdicts, and drives an escalating multi-channel alarm: siren, strobe,
//! guardian SMS and a timed autodial fallback.
//!
//! Platform glue (camera detector, BLE radio, telephony, GPS, weather)
//! stays behind the traits in [`providers`] and [`link::transport`]; the
//! engines here own all timing, state machines and escalation policy.

pub mod alarm;
pub mod audio;
pub mod cognitive;
pub mod coordinator;
pub mod eog;
pub mod events;
pub mod fusion;
pub mod link;
pub mod providers;
pub mod settings;
pub mod utils;

pub use alarm::{AlarmConfig, AlarmEngine, AlarmSnapshot};
pub use cognitive::{CognitiveConfig, CognitiveScheduler};
pub use coordinator::spawn_drowsiness_coordinator;
pub use eog::{EogConfig, EogEngine, EogSnapshot, ProtocolPhase};
pub use events::{EventBus, FatigueEvent, TriggerSource};
pub use fusion::{FaceFrame, FrameSource, FusionConfig, FusionController};
pub use link::{DeviceLinkManager, LinkConfig, LinkSnapshot};
pub use settings::SettingsStore;
