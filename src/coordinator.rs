//! Drowsiness coordinator: the single consumer of the fatigue event bus.
//!
//! Camera fusion, the EOG engine and the cognitive checks all publish
//! trigger events without knowing about each other or about the alarm
//! engine; this task turns any of them into one escalation and pauses
//! camera monitoring while the alarm runs.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::alarm::AlarmEngine;
use crate::events::EventBus;
use crate::fusion::{FrameSource, FusionController};
use crate::providers::{Actuation, LocationProvider, TripLog, WeatherProvider};

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

/// Spawns the coordinator task. Cancel the returned token to shut it down.
pub fn spawn_drowsiness_coordinator<A, PL, T, C, L, W>(
    bus: &EventBus,
    alarm: AlarmEngine<A, PL, T>,
    fusion: FusionController<C, L, W>,
) -> CancellationToken
where
    A: Actuation + 'static,
    PL: LocationProvider + 'static,
    T: TripLog + 'static,
    C: FrameSource,
    L: LocationProvider + 'static,
    W: WeatherProvider + 'static,
{
    let token = CancellationToken::new();
    let mut events = bus.subscribe();
    let guard = token.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = guard.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if alarm.is_playing() {
                            continue;
                        }
                        log_warn!("fatigue event {event:?}, escalating");
                        alarm.trigger(event.source()).await;
                        // Free the camera while the alarm runs; fusion
                        // cannot add anything to a live session.
                        fusion.pause_monitoring().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log_warn!("coordinator lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        log_info!("coordinator stopped");
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmConfig;
    use crate::events::{FatigueEvent, TriggerSource};
    use crate::fusion::{FaceFrame, FusionConfig};
    use crate::providers::{
        LocationSnapshot, NullActuation, TripLog, WeatherCondition, WeatherProvider,
    };
    use crate::settings::SettingsStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    struct NoCamera;

    impl FrameSource for NoCamera {
        fn latest_frame(&self) -> Option<FaceFrame> {
            None
        }
    }

    struct StaticLocation(LocationSnapshot);

    impl LocationProvider for StaticLocation {
        fn snapshot(&self) -> LocationSnapshot {
            self.0
        }
    }

    struct ClearWeather;

    impl WeatherProvider for ClearWeather {
        fn condition(&self) -> WeatherCondition {
            WeatherCondition::Normal
        }
    }

    #[derive(Default)]
    struct CountingTripLog(AtomicUsize);

    impl TripLog for CountingTripLog {
        fn increment_alert_count(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sleepy_event_starts_one_alarm_and_pauses_fusion() {
        let dir = tempdir().unwrap();
        let settings =
            Arc::new(SettingsStore::new(dir.path().join("settings.json")).unwrap());
        let bus = EventBus::default();
        let location = Arc::new(StaticLocation(LocationSnapshot::default()));
        let trip_log = Arc::new(CountingTripLog::default());

        let alarm = AlarmEngine::new(
            Arc::new(NullActuation),
            Arc::clone(&location),
            Arc::clone(&trip_log),
            Arc::clone(&settings),
            AlarmConfig {
                volume_gap: Duration::from_millis(1),
                autodial_delay: Duration::from_secs(60),
                ..AlarmConfig::default()
            },
        );
        let fusion = FusionController::new(
            Arc::new(NoCamera),
            location,
            Arc::new(ClearWeather),
            settings,
            bus.clone(),
            alarm.playing_flag(),
            FusionConfig {
                sample_interval: Duration::from_millis(5),
                ..FusionConfig::default()
            },
        );
        fusion.start_monitoring().await;

        let token = spawn_drowsiness_coordinator(&bus, alarm.clone(), fusion.clone());

        bus.publish(FatigueEvent::SleepyMinute { minute: 2 });
        bus.publish(FatigueEvent::CognitiveTimeout);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = alarm.snapshot().await;
        assert!(snap.alarm_playing);
        // First event wins; the second is a no-op against the live session.
        assert_eq!(snap.triggered_by, Some(TriggerSource::EogSensor));
        assert_eq!(trip_log.0.load(Ordering::SeqCst), 1);
        assert!(!fusion.snapshot().await.camera_active);

        token.cancel();
    }
}
