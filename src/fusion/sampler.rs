//! Bounded-rate frame sampler and calibration driver around the fusion
//! engine. Polls the camera collaborator at a fixed cadence so fusion sees
//! frames in capture order regardless of display frame rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, FatigueEvent};
use crate::providers::{LocationProvider, WeatherProvider};
use crate::settings::SettingsStore;

use super::config::effective_config;
use super::engine::{FaceFrame, FrameVerdict, FusionEngine, FusionSnapshot};

const ENABLE_LOGS: bool = true;
use crate::{log_error, log_info, log_warn};

/// Camera collaborator: hands over the most recent detector result.
/// `None` means no face was found in the latest frame.
pub trait FrameSource: Send + Sync + 'static {
    fn latest_frame(&self) -> Option<FaceFrame>;
}

#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Frame sampling cadence (5 Hz in production).
    pub sample_interval: Duration,
    pub calibration_tick: Duration,
    pub calibration_ticks: u32,
    pub front_camera: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(200),
            calibration_tick: Duration::from_millis(300),
            calibration_ticks: 10,
            front_camera: true,
        }
    }
}

pub struct FusionController<C, L, W>
where
    C: FrameSource,
    L: LocationProvider + 'static,
    W: WeatherProvider + 'static,
{
    engine: Arc<Mutex<FusionEngine>>,
    camera: Arc<C>,
    location: Arc<L>,
    weather: Arc<W>,
    settings: Arc<SettingsStore>,
    bus: EventBus,
    config: FusionConfig,
    /// Set by the alarm engine while a session is live; suppresses triggers.
    alarm_gate: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<CancellationToken>>>,
    calibration: Arc<Mutex<Option<CancellationToken>>>,
}

impl<C, L, W> Clone for FusionController<C, L, W>
where
    C: FrameSource,
    L: LocationProvider + 'static,
    W: WeatherProvider + 'static,
{
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            camera: Arc::clone(&self.camera),
            location: Arc::clone(&self.location),
            weather: Arc::clone(&self.weather),
            settings: Arc::clone(&self.settings),
            bus: self.bus.clone(),
            config: self.config,
            alarm_gate: Arc::clone(&self.alarm_gate),
            worker: Arc::clone(&self.worker),
            calibration: Arc::clone(&self.calibration),
        }
    }
}

impl<C, L, W> FusionController<C, L, W>
where
    C: FrameSource,
    L: LocationProvider + 'static,
    W: WeatherProvider + 'static,
{
    pub fn new(
        camera: Arc<C>,
        location: Arc<L>,
        weather: Arc<W>,
        settings: Arc<SettingsStore>,
        bus: EventBus,
        alarm_gate: Arc<AtomicBool>,
        config: FusionConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(FusionEngine::new(config.front_camera))),
            camera,
            location,
            weather,
            settings,
            bus,
            config,
            alarm_gate,
            worker: Arc::new(Mutex::new(None)),
            calibration: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn snapshot(&self) -> FusionSnapshot {
        self.engine.lock().await.snapshot()
    }

    /// Activates the camera and starts the sampling worker. A no-op while
    /// already monitoring.
    pub async fn start_monitoring(&self) {
        {
            let mut engine = self.engine.lock().await;
            if engine.is_camera_active() {
                return;
            }
            engine.start_camera(chrono::Local::now().hour());
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.worker.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => controller.process_frame().await,
                }
            }
        });
        log_info!("fusion monitoring started");
    }

    /// Stops frame intake but keeps tracking state, as when the alarm
    /// engine takes over.
    pub async fn pause_monitoring(&self) {
        if let Some(token) = self.worker.lock().await.take() {
            token.cancel();
        }
        self.engine.lock().await.pause_camera();
    }

    pub async fn stop_monitoring(&self) {
        if let Some(token) = self.worker.lock().await.take() {
            token.cancel();
        }
        self.cancel_calibration().await;
        self.engine.lock().await.stop_camera();
        log_info!("fusion monitoring stopped");
    }

    async fn process_frame(&self) {
        let frame = self.camera.latest_frame();
        let location = self.location.snapshot();
        let config = effective_config(
            self.settings.preferred_mode(),
            &self.settings.custom_config(),
            self.settings.eye_threshold(),
            self.weather.condition(),
            location.speed_kmh(),
        );
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let alarm_active = self.alarm_gate.load(Ordering::SeqCst);

        let verdict = self
            .engine
            .lock()
            .await
            .on_frame(frame, now_ms, &config, alarm_active);

        if let FrameVerdict::Trigger {
            duration_ms,
            effective_delay_ms,
        } = verdict
        {
            if config.require_driving && !location.is_driving_now() {
                return;
            }
            log_warn!("eyes closed {duration_ms}ms, limit {effective_delay_ms}ms");
            self.bus.publish(FatigueEvent::EyesClosed {
                duration_ms,
                effective_delay_ms,
            });
        }
    }

    /// Runs the fixed-length calibration pass, then persists the new
    /// threshold if enough samples were collected.
    pub async fn start_calibration(&self) {
        self.start_monitoring().await;
        self.engine.lock().await.start_calibration();

        let token = CancellationToken::new();
        if let Some(previous) = self.calibration.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let controller = self.clone();
        tokio::spawn(async move {
            let ticks = controller.config.calibration_ticks.max(1);
            for step in 1..=ticks {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(controller.config.calibration_tick) => {}
                }
                let progress = (step * 100 / ticks) as u8;
                controller
                    .engine
                    .lock()
                    .await
                    .set_calibration_progress(progress);
            }

            match controller.engine.lock().await.finish_calibration() {
                Some(threshold) => {
                    log_info!("calibration done, new threshold {threshold:.2}");
                    if let Err(err) = controller.settings.set_eye_threshold(threshold) {
                        log_error!("failed to persist calibrated threshold: {err:#}");
                    }
                }
                None => log_warn!("calibration discarded, too few samples"),
            }
        });
    }

    pub async fn cancel_calibration(&self) {
        if let Some(token) = self.calibration.lock().await.take() {
            token.cancel();
        }
        self.engine.lock().await.cancel_calibration();
    }
}
