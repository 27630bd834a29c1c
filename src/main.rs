//! Headless simulator: wires the engines to a scripted wearable, camera and
//! location so the whole trigger-to-escalation path can be watched from a
//! terminal. Run with `RUST_LOG=info`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wakeguard::audio::DesktopActuation;
use wakeguard::fusion::FaceFrame;
use wakeguard::link::transport::{
    uuids, BleTransport, DeviceHandle, LinkError, ScannedDevice, WriteMode,
};
use wakeguard::providers::{
    Coordinates, LocationProvider, LocationSnapshot, TripLog, VoicePrompt, WeatherCondition,
    WeatherProvider,
};
use wakeguard::{
    spawn_drowsiness_coordinator, AlarmConfig, AlarmEngine, CognitiveConfig, CognitiveScheduler,
    DeviceLinkManager, EogConfig, EogEngine, EventBus, FrameSource, FusionConfig,
    FusionController, LinkConfig, ProtocolPhase, SettingsStore,
};

/// Scripted wearable firmware: answers calibration with a success line and
/// classifies the third running minute as sleepy.
struct SimWearable {
    notify_sinks: StdMutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    scan_sink: StdMutex<Option<mpsc::Sender<ScannedDevice>>>,
    minute_task: StdMutex<Option<CancellationToken>>,
}

impl SimWearable {
    fn new() -> Self {
        Self {
            notify_sinks: StdMutex::new(HashMap::new()),
            scan_sink: StdMutex::new(None),
            minute_task: StdMutex::new(None),
        }
    }

    fn eog_sink(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.notify_sinks
            .lock()
            .unwrap()
            .get(uuids::EOG_NOTIFY_CHARACTERISTIC)
            .cloned()
    }

    fn stop_minutes(&self) {
        if let Some(token) = self.minute_task.lock().unwrap().take() {
            token.cancel();
        }
    }

    fn start_minutes(&self) {
        self.stop_minutes();
        let Some(sink) = self.eog_sink() else {
            return;
        };
        let token = CancellationToken::new();
        *self.minute_task.lock().unwrap() = Some(token.clone());

        tokio::spawn(async move {
            let mut minute = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
                minute += 1;
                let (normal, slow) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(8..=18), rng.gen_range(0..=4))
                };
                let flag = if minute == 3 { "S-" } else { "NS-" };
                let line = format!(r#"["M{minute}",{normal},{slow},"{flag}"]"#);
                if sink.send(BASE64.encode(line).into_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl BleTransport for SimWearable {
    async fn start_scan(&self, found: mpsc::Sender<ScannedDevice>) -> Result<(), LinkError> {
        *self.scan_sink.lock().unwrap() = Some(found.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = found
                .send(ScannedDevice {
                    id: "eog-band-01".to_string(),
                    name: Some("NeuroBand".to_string()),
                    rssi: -58,
                })
                .await;
        });
        Ok(())
    }

    async fn stop_scan(&self) {
        self.scan_sink.lock().unwrap().take();
    }

    async fn connect(&self, device_id: &str) -> Result<DeviceHandle, LinkError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(DeviceHandle {
            id: device_id.to_string(),
            name: Some("NeuroBand".to_string()),
        })
    }

    async fn disconnect(&self, _device_id: &str) {
        self.stop_minutes();
        self.notify_sinks.lock().unwrap().clear();
    }

    async fn subscribe(
        &self,
        _device_id: &str,
        characteristic: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), LinkError> {
        self.notify_sinks
            .lock()
            .unwrap()
            .insert(characteristic.to_string(), sink.clone());

        if characteristic == uuids::GYRO_CHARACTERISTIC {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let payload = {
                        let mut rng = rand::thread_rng();
                        format!(
                            r#"{{"pitch":{:.1},"roll":{:.1},"yaw":{:.1}}}"#,
                            rng.gen_range(-5.0..5.0),
                            rng.gen_range(-3.0..3.0),
                            rng.gen_range(0.0..360.0)
                        )
                    };
                    if sink.send(payload.into_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        } else if characteristic == uuids::BATTERY_CHARACTERISTIC {
            tokio::spawn(async move {
                let _ = sink.send(b"93".to_vec()).await;
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        _device_id: &str,
        _characteristic: &str,
        payload: &[u8],
        _mode: WriteMode,
    ) -> Result<(), LinkError> {
        let decoded = BASE64
            .decode(payload)
            .map_err(|e| LinkError::CommandWriteFailure(e.to_string()))?;
        match decoded.first() {
            Some(b'C') => {
                if let Some(sink) = self.eog_sink() {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        let line = BASE64.encode("Calibracao concluida com sucesso");
                        let _ = sink.send(line.into_bytes()).await;
                    });
                }
            }
            Some(b'S') => self.start_minutes(),
            Some(b'X') => self.stop_minutes(),
            _ => {}
        }
        Ok(())
    }

    async fn read_rssi(&self, _device_id: &str) -> Result<i16, LinkError> {
        Ok(-55)
    }

    async fn watch_disconnect(&self, _device_id: &str, _notify: mpsc::Sender<bool>) {}
}

/// Eyes open, except for a sustained closure starting 20 seconds in.
struct SimCamera {
    started: Instant,
}

impl FrameSource for SimCamera {
    fn latest_frame(&self) -> Option<FaceFrame> {
        let elapsed = self.started.elapsed().as_secs();
        let openness = if (20..26).contains(&elapsed) { 0.03 } else { 0.95 };
        Some(FaceFrame {
            left_eye_open: openness,
            right_eye_open: openness,
        })
    }
}

struct SimLocation;

impl LocationProvider for SimLocation {
    fn snapshot(&self) -> LocationSnapshot {
        LocationSnapshot {
            speed_mps: 25.0, // 90 km/h
            is_driving: true,
            coordinates: Some(Coordinates {
                latitude: 38.7223,
                longitude: -9.1393,
            }),
        }
    }
}

struct SimWeather;

impl WeatherProvider for SimWeather {
    fn condition(&self) -> WeatherCondition {
        WeatherCondition::Normal
    }
}

#[derive(Default)]
struct LogTripLog(AtomicUsize);

impl TripLog for LogTripLog {
    fn increment_alert_count(&self) {
        let count = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("trip alert count: {count}");
    }
}

struct LogVoice;

impl VoicePrompt for LogVoice {
    fn speak(&self, text: &str) {
        log::info!("[voice] {text}");
    }
}

async fn wait_for_phase(
    engine: &EogEngine<SimWearable>,
    phase: ProtocolPhase,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if engine.snapshot().await.phase == phase {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("wearable never reached {phase:?}")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Arc::new(SettingsStore::new(PathBuf::from("wakeguard-settings.json"))?);
    let bus = EventBus::default();

    // Link up the scripted wearable.
    let wearable = Arc::new(SimWearable::new());
    let link = DeviceLinkManager::new(
        Arc::clone(&wearable),
        Arc::clone(&settings),
        LinkConfig::default(),
    );
    link.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let scanned = link.snapshot().await.scanned_devices;
    let device = scanned.first().context("no wearable discovered")?.clone();
    log::info!("discovered {} ({:?}, {} dBm)", device.id, device.name, device.rssi);

    link.connect(&device.id).await?;
    link.remember_device(&device.id).await?;

    // Walk the wearable through calibration, baseline and run. The shortened
    // countdown tick keeps the demo under a minute.
    let eog = EogEngine::new(
        Arc::clone(&wearable),
        bus.clone(),
        EogConfig {
            countdown_tick: Duration::from_millis(150),
        },
    );
    let lines = link
        .take_eog_stream()
        .await
        .context("eog stream already taken")?;
    eog.attach(&device.id, lines).await;

    eog.main_button().await?;
    wait_for_phase(&eog, ProtocolPhase::ReadyToBlink, Duration::from_secs(20)).await?;
    log::info!("calibration complete");
    eog.main_button().await?;
    wait_for_phase(&eog, ProtocolPhase::ReadyToStart, Duration::from_secs(20)).await?;
    eog.main_button().await?;
    log::info!("wearable running");

    // Fusion, alarm, cognitive checks and the coordinator.
    let location = Arc::new(SimLocation);
    let trip_log = Arc::new(LogTripLog::default());
    let alarm = AlarmEngine::new(
        Arc::new(DesktopActuation::new()),
        Arc::clone(&location),
        trip_log,
        Arc::clone(&settings),
        AlarmConfig::default(),
    );
    let fusion = FusionController::new(
        Arc::new(SimCamera {
            started: Instant::now(),
        }),
        Arc::clone(&location),
        Arc::new(SimWeather),
        Arc::clone(&settings),
        bus.clone(),
        alarm.playing_flag(),
        FusionConfig::default(),
    );
    let cognitive = CognitiveScheduler::new(
        Arc::new(LogVoice),
        bus.clone(),
        CognitiveConfig {
            challenge_interval: Duration::from_secs(45),
            poll_interval: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
        },
    );

    let coordinator = spawn_drowsiness_coordinator(&bus, alarm.clone(), fusion.clone());
    fusion.start_monitoring().await;
    cognitive.start_monitoring().await;

    for _ in 0..18 {
        tokio::time::sleep(Duration::from_secs(5)).await;

        let link_snap = link.snapshot().await;
        let fusion_snap = fusion.snapshot().await;
        let alarm_snap = alarm.snapshot().await;
        log::info!(
            "rssi {} dBm, battery {}%, eyes closed {} ({} ms), alarm {}",
            link_snap.rssi,
            link_snap.battery_level,
            fusion_snap.is_eyes_closed,
            fusion_snap.eyes_closed_duration_ms,
            alarm_snap.alarm_playing,
        );
        if alarm_snap.suggest_rest_stop {
            log::warn!("rest stop suggested");
        }

        if alarm.is_playing() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            alarm.stop().await;
            fusion.start_monitoring().await;
            log::info!("alarm acknowledged, monitoring resumed");
        }
    }

    print!("{}", eog.session_report().await);

    coordinator.cancel();
    cognitive.stop_monitoring().await;
    fusion.stop_monitoring().await;
    eog.detach().await;
    link.disconnect().await;
    Ok(())
}
