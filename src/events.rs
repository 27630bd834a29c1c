//! Fatigue event bus.
//!
//! Both sensing paths (camera fusion and the EOG wearable) publish trigger
//! events here instead of calling into each other; a single coordinator task
//! consumes the stream and drives the alarm engine. This keeps the two paths
//! decoupled from each other's concrete types.

use serde::Serialize;
use tokio::sync::broadcast;

/// Which sensing path asked for the alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerSource {
    Camera,
    EogSensor,
    CognitiveCheck,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FatigueEvent {
    /// Camera path: smoothed eye closure exceeded the effective delay.
    EyesClosed {
        duration_ms: u64,
        effective_delay_ms: u64,
    },
    /// EOG path: the wearable classified the last minute as sleepy.
    SleepyMinute { minute: u32 },
    /// Attention challenge went unanswered.
    CognitiveTimeout,
}

impl FatigueEvent {
    pub fn source(&self) -> TriggerSource {
        match self {
            FatigueEvent::EyesClosed { .. } => TriggerSource::Camera,
            FatigueEvent::SleepyMinute { .. } => TriggerSource::EogSensor,
            FatigueEvent::CognitiveTimeout => TriggerSource::CognitiveCheck,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FatigueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishing with no live subscriber is not an error; the event is
    /// simply dropped.
    pub fn publish(&self, event: FatigueEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FatigueEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
