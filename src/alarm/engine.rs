//! Alarm escalation: max volume, siren, guardian SMS, strobe, rest-stop
//! heuristic and the 20-second autodial fallback.
//!
//! Every step is best-effort. A failed actuation call is logged and the
//! remaining steps still run; escalation is additive, not all-or-nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::TriggerSource;
use crate::providers::{Actuation, LocationProvider, TripLog};
use crate::settings::SettingsStore;

use super::history::AlarmHistory;

const ENABLE_LOGS: bool = true;
use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Gap between the two max-volume calls; defeats volume-ducking races.
    pub volume_gap: Duration,
    /// How long an unacknowledged alarm runs before the autodial fires.
    pub autodial_delay: Duration,
    /// Dialed when no emergency contact is configured.
    pub emergency_number: String,
    /// Route the siren through the car's hands-free profile when available.
    pub via_car_audio: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            volume_gap: Duration::from_millis(500),
            autodial_delay: Duration::from_secs(20),
            emergency_number: "112".to_string(),
            via_car_audio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSnapshot {
    pub alarm_playing: bool,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<TriggerSource>,
    pub suggest_rest_stop: bool,
}

struct AlarmSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    source: TriggerSource,
}

struct AlarmState {
    history: AlarmHistory,
    session: Option<AlarmSession>,
}

pub struct AlarmEngine<A, L, T>
where
    A: Actuation + 'static,
    L: LocationProvider + 'static,
    T: TripLog + 'static,
{
    actuation: Arc<A>,
    location: Arc<L>,
    trip_log: Arc<T>,
    settings: Arc<SettingsStore>,
    config: AlarmConfig,
    /// Live-session flag; also gates the fusion sampler.
    playing: Arc<AtomicBool>,
    /// In-flight guard; together with `playing` it makes trigger idempotent.
    triggering: Arc<AtomicBool>,
    state: Arc<Mutex<AlarmState>>,
}

impl<A, L, T> Clone for AlarmEngine<A, L, T>
where
    A: Actuation + 'static,
    L: LocationProvider + 'static,
    T: TripLog + 'static,
{
    fn clone(&self) -> Self {
        Self {
            actuation: Arc::clone(&self.actuation),
            location: Arc::clone(&self.location),
            trip_log: Arc::clone(&self.trip_log),
            settings: Arc::clone(&self.settings),
            config: self.config.clone(),
            playing: Arc::clone(&self.playing),
            triggering: Arc::clone(&self.triggering),
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, L, T> AlarmEngine<A, L, T>
where
    A: Actuation + 'static,
    L: LocationProvider + 'static,
    T: TripLog + 'static,
{
    pub fn new(
        actuation: Arc<A>,
        location: Arc<L>,
        trip_log: Arc<T>,
        settings: Arc<SettingsStore>,
        config: AlarmConfig,
    ) -> Self {
        Self {
            actuation,
            location,
            trip_log,
            settings,
            config,
            playing: Arc::new(AtomicBool::new(false)),
            triggering: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(AlarmState {
                history: AlarmHistory::new(),
                session: None,
            })),
        }
    }

    /// Shared with the fusion sampler so it stops re-triggering while a
    /// session is live.
    pub fn playing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.playing)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> AlarmSnapshot {
        let st = self.state.lock().await;
        AlarmSnapshot {
            alarm_playing: self.is_playing(),
            session_id: st.session.as_ref().map(|s| s.id),
            started_at: st.session.as_ref().map(|s| s.started_at),
            triggered_by: st.session.as_ref().map(|s| s.source),
            suggest_rest_stop: st.history.suggest_rest_stop(),
        }
    }

    /// Runs the escalation sequence. A call while a session is live or
    /// another trigger is mid-flight is a no-op.
    pub async fn trigger(&self, source: TriggerSource) {
        if self.playing.load(Ordering::SeqCst) {
            return;
        }
        if self.triggering.swap(true, Ordering::SeqCst) {
            return;
        }
        self.playing.store(true, Ordering::SeqCst);

        let session_id = Uuid::new_v4();
        {
            let mut st = self.state.lock().await;
            st.session = Some(AlarmSession {
                id: session_id,
                started_at: Utc::now(),
                source,
            });
        }
        log_error!("fatigue alarm {session_id} triggered by {source:?}");

        // Twice with a gap: a first max-volume call can be ducked by the
        // platform while other audio winds down.
        best_effort(self.actuation.set_max_volume(), "set_max_volume");
        tokio::time::sleep(self.config.volume_gap).await;
        best_effort(self.actuation.set_max_volume(), "set_max_volume");

        best_effort(
            self.actuation.play_alarm(self.config.via_car_audio),
            "play_alarm",
        );

        self.send_guardian_sms();
        self.trip_log.increment_alert_count();

        let now_ms = Utc::now().timestamp_millis() as u64;
        let suggest_rest = {
            let mut st = self.state.lock().await;
            st.history.record(now_ms)
        };
        if suggest_rest {
            log_warn!("repeated alarms inside the window, suggesting a rest stop");
        }

        if self.settings.strobe_enabled() {
            best_effort(self.actuation.start_strobe(), "start_strobe");
        }

        self.spawn_autodial();
        self.triggering.store(false, Ordering::SeqCst);
    }

    /// Manual stop: silences audio and strobe, ends the session. The
    /// rest-stop suggestion and history are untouched.
    pub async fn stop(&self) {
        if !self.playing.swap(false, Ordering::SeqCst) {
            return;
        }
        best_effort(self.actuation.stop_alarm(), "stop_alarm");
        best_effort(self.actuation.stop_strobe(), "stop_strobe");
        self.state.lock().await.session = None;
        log_info!("alarm stopped manually");
    }

    pub async fn dismiss_rest_stop(&self) {
        self.state.lock().await.history.dismiss_rest_stop();
    }

    fn send_guardian_sms(&self) {
        let contact = self.settings.emergency_contact();
        if contact.is_empty() {
            return;
        }
        let location = self.location.snapshot();
        let (lat, lng) = location
            .coordinates
            .map(|c| (c.latitude, c.longitude))
            .unwrap_or((0.0, 0.0));
        let message = format!(
            "URGENT: extreme fatigue detected. Location: maps.google.com/?q={lat},{lng}"
        );
        best_effort(self.actuation.send_sms(&contact, &message), "send_sms");
    }

    /// One-shot timer; not cancellable, but it checks liveness when it
    /// fires, so a stopped alarm never dials.
    fn spawn_autodial(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.autodial_delay).await;
            if !engine.playing.load(Ordering::SeqCst) {
                return;
            }

            let contact = engine.settings.emergency_contact();
            let number = if contact.trim().is_empty() {
                engine.config.emergency_number.clone()
            } else {
                contact
            };
            log_error!("alarm unacknowledged, dialing {number}");
            if let Err(err) = engine.actuation.call_phone(&number) {
                log_error!("direct call failed ({err:#}), opening system dialer");
                best_effort(engine.actuation.open_dialer(&number), "open_dialer");
            }
        });
    }
}

fn best_effort(result: anyhow::Result<()>, step: &str) {
    if let Err(err) = result {
        log_warn!("{step} failed: {err:#}");
    }
}
