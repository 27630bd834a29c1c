//! Device link manager: scanning, connection lifecycle, characteristic
//! subscriptions, RSSI polling and auto-reconnect over a [`BleTransport`].

pub mod transport;

pub use transport::{BleTransport, DeviceHandle, LinkError, ScannedDevice, WriteMode};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::settings::SettingsStore;
use transport::uuids;

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

const EOG_STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Discovery auto-stops after this long if not stopped manually.
    pub scan_timeout: Duration,
    /// Delay before an auto-reconnect attempt after an unexpected drop.
    pub reconnect_delay: Duration,
    /// Signal-strength polling cadence while connected.
    pub rssi_interval: Duration,
    pub auto_reconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            rssi_interval: Duration::from_secs(2),
            auto_reconnect: true,
        }
    }
}

/// Orientation telemetry from the gyro characteristic, degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GyroData {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSnapshot {
    pub connected: bool,
    pub device: Option<DeviceHandle>,
    pub connecting_device_id: Option<String>,
    pub scanning: bool,
    pub scanned_devices: Vec<ScannedDevice>,
    pub rssi: i16,
    pub battery_level: u8,
    pub gyro: GyroData,
    pub last_error: Option<String>,
}

struct LinkState {
    device: Option<DeviceHandle>,
    connecting: Option<String>,
    scanning: bool,
    scanned: Vec<ScannedDevice>,
    rssi: i16,
    battery_level: u8,
    gyro: GyroData,
    last_error: Option<String>,
    /// Bumped by every connect/disconnect; an in-flight attempt whose
    /// generation no longer matches discards its own result.
    generation: u64,
}

impl LinkState {
    fn new() -> Self {
        Self {
            device: None,
            connecting: None,
            scanning: false,
            scanned: Vec::new(),
            rssi: 0,
            battery_level: 100,
            gyro: GyroData::default(),
            last_error: None,
            generation: 0,
        }
    }

    fn reset_link(&mut self) {
        self.device = None;
        self.connecting = None;
        self.rssi = 0;
        self.gyro = GyroData::default();
    }
}

/// Owns the single BLE link. All shared state sits behind one mutex so the
/// at-most-one-connection invariant holds on a multi-threaded runtime.
pub struct DeviceLinkManager<T: BleTransport> {
    transport: Arc<T>,
    state: Arc<Mutex<LinkState>>,
    settings: Arc<SettingsStore>,
    config: LinkConfig,
    /// Cancels the per-connection tasks (telemetry, RSSI poll, watcher).
    link_tasks: Arc<Mutex<Option<CancellationToken>>>,
    /// Cancels a pending auto-reconnect.
    reconnect: Arc<Mutex<Option<CancellationToken>>>,
    eog_tx: mpsc::Sender<Vec<u8>>,
    eog_rx: Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
}

impl<T: BleTransport> Clone for DeviceLinkManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            settings: Arc::clone(&self.settings),
            config: self.config,
            link_tasks: Arc::clone(&self.link_tasks),
            reconnect: Arc::clone(&self.reconnect),
            eog_tx: self.eog_tx.clone(),
            eog_rx: Arc::clone(&self.eog_rx),
        }
    }
}

impl<T: BleTransport> DeviceLinkManager<T> {
    pub fn new(transport: Arc<T>, settings: Arc<SettingsStore>, config: LinkConfig) -> Self {
        let (eog_tx, eog_rx) = mpsc::channel(EOG_STREAM_CAPACITY);
        Self {
            transport,
            state: Arc::new(Mutex::new(LinkState::new())),
            settings,
            config,
            link_tasks: Arc::new(Mutex::new(None)),
            reconnect: Arc::new(Mutex::new(None)),
            eog_tx,
            eog_rx: Arc::new(Mutex::new(Some(eog_rx))),
        }
    }

    /// Raw EOG notify payloads, surviving reconnects. Can be taken once;
    /// the protocol engine consumes it.
    pub async fn take_eog_stream(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.eog_rx.lock().await.take()
    }

    pub async fn snapshot(&self) -> LinkSnapshot {
        let st = self.state.lock().await;
        LinkSnapshot {
            connected: st.device.is_some(),
            device: st.device.clone(),
            connecting_device_id: st.connecting.clone(),
            scanning: st.scanning,
            scanned_devices: st.scanned.clone(),
            rssi: st.rssi,
            battery_level: st.battery_level,
            gyro: st.gyro,
            last_error: st.last_error.clone(),
        }
    }

    /// Begins discovery. A no-op while already scanning or while a
    /// connection attempt is in flight. Auto-stops after the configured
    /// timeout unless stopped manually first.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        {
            let st = self.state.lock().await;
            if st.scanning || st.connecting.is_some() {
                return Ok(());
            }
        }

        let (tx, mut rx) = mpsc::channel::<ScannedDevice>(32);
        if let Err(err) = self.transport.start_scan(tx).await {
            let mut st = self.state.lock().await;
            st.last_error = Some(err.to_string());
            if matches!(err, LinkError::RadioUnavailable) {
                st.reset_link();
            }
            return Err(err);
        }

        {
            let mut st = self.state.lock().await;
            st.scanning = true;
            st.scanned.clear();
            st.last_error = None;
        }
        log_info!("scan started (timeout {:?})", self.config.scan_timeout);

        let manager = self.clone();
        let timeout = self.config.scan_timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    found = rx.recv() => match found {
                        Some(device) => {
                            let mut st = manager.state.lock().await;
                            // last-seen wins; insertion order is irrelevant
                            if let Some(existing) =
                                st.scanned.iter_mut().find(|d| d.id == device.id)
                            {
                                *existing = device;
                            } else {
                                st.scanned.push(device);
                            }
                        }
                        // Sender dropped: scan was stopped manually.
                        None => break,
                    },
                }
            }
            manager.finish_scan().await;
        });

        Ok(())
    }

    pub async fn stop_scan(&self) {
        self.finish_scan().await;
    }

    async fn finish_scan(&self) {
        let was_scanning = {
            let mut st = self.state.lock().await;
            std::mem::replace(&mut st.scanning, false)
        };
        if was_scanning {
            self.transport.stop_scan().await;
            log_info!("scan stopped");
        }
    }

    /// Connects to `device_id`: cancels any pending reconnect and in-flight
    /// attempt, tears down an existing link, then establishes the new one
    /// and subscribes to the gyro/battery/EOG characteristics.
    pub async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        self.cancel_reconnect().await;
        self.stop_scan().await;

        let my_generation = {
            let mut st = self.state.lock().await;
            st.generation += 1;
            st.connecting = Some(device_id.to_string());
            st.last_error = None;
            st.generation
        };

        self.teardown_link().await;
        log_info!("connecting to {device_id}...");

        let handle = match self.transport.connect(device_id).await {
            Ok(handle) => handle,
            Err(err) => {
                let mut st = self.state.lock().await;
                if st.generation == my_generation {
                    st.connecting = None;
                    st.last_error = Some(err.to_string());
                    if matches!(err, LinkError::RadioUnavailable) {
                        st.reset_link();
                    }
                }
                return Err(err);
            }
        };

        {
            let mut st = self.state.lock().await;
            if st.generation != my_generation {
                // A newer connect or disconnect superseded this attempt;
                // release the link we just obtained and bow out.
                drop(st);
                self.transport.disconnect(device_id).await;
                log_info!("connect attempt to {device_id} superseded, discarded");
                return Ok(());
            }
            st.device = Some(handle.clone());
            st.connecting = None;
        }

        let token = CancellationToken::new();
        *self.link_tasks.lock().await = Some(token.clone());

        if let Err(err) = self.subscribe_all(device_id).await {
            log_warn!("subscription setup failed for {device_id}: {err}");
            self.state.lock().await.last_error = Some(err.to_string());
            self.teardown_link().await;
            return Err(err);
        }

        self.spawn_rssi_poll(device_id.to_string(), token.clone());
        self.spawn_disconnect_watcher(device_id.to_string(), token).await;

        log_info!("connected to {} ({:?})", handle.id, handle.name);
        Ok(())
    }

    /// Explicit teardown. Clears any pending auto-reconnect first so a
    /// deliberate disconnect never races a scheduled reconnect.
    pub async fn disconnect(&self) {
        self.cancel_reconnect().await;
        {
            // Invalidate any in-flight connect attempt.
            let mut st = self.state.lock().await;
            st.generation += 1;
        }
        self.teardown_link().await;
        log_info!("disconnected");
    }

    pub async fn remember_device(&self, device_id: &str) -> anyhow::Result<()> {
        self.settings.remember_device(device_id)
    }

    pub async fn forget_device(&self, device_id: &str) -> anyhow::Result<()> {
        self.settings.forget_device(device_id)
    }

    /// Startup path: tries the most-recently-remembered device, if any.
    pub async fn connect_to_remembered(&self) -> Result<(), LinkError> {
        match self.settings.last_remembered_device() {
            Some(id) => self.connect(&id).await,
            None => {
                log_info!("no remembered device to connect to");
                Ok(())
            }
        }
    }

    async fn teardown_link(&self) {
        if let Some(token) = self.link_tasks.lock().await.take() {
            token.cancel();
        }
        let device = {
            let mut st = self.state.lock().await;
            let device = st.device.take();
            st.connecting = None;
            st.rssi = 0;
            st.gyro = GyroData::default();
            device
        };
        if let Some(device) = device {
            self.transport.disconnect(&device.id).await;
        }
    }

    async fn cancel_reconnect(&self) {
        if let Some(token) = self.reconnect.lock().await.take() {
            token.cancel();
        }
    }

    async fn subscribe_all(&self, device_id: &str) -> Result<(), LinkError> {
        let (gyro_tx, mut gyro_rx) = mpsc::channel::<Vec<u8>>(16);
        self.transport
            .subscribe(device_id, uuids::GYRO_CHARACTERISTIC, gyro_tx)
            .await?;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(payload) = gyro_rx.recv().await {
                // Decode failures are swallowed; a corrupted notify must not
                // destabilize the link.
                match serde_json::from_slice::<GyroData>(&payload) {
                    Ok(gyro) => state.lock().await.gyro = gyro,
                    Err(err) => log_warn!("gyro payload decode failed: {err}"),
                }
            }
        });

        let (battery_tx, mut battery_rx) = mpsc::channel::<Vec<u8>>(16);
        self.transport
            .subscribe(device_id, uuids::BATTERY_CHARACTERISTIC, battery_tx)
            .await?;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(payload) = battery_rx.recv().await {
                if let Ok(text) = std::str::from_utf8(&payload) {
                    if let Ok(level) = text.trim().parse::<u8>() {
                        state.lock().await.battery_level = level.min(100);
                    }
                }
            }
        });

        // EOG notify lines flow into the long-lived stream the protocol
        // engine consumes; the transport drops its sender on disconnect.
        self.transport
            .subscribe(device_id, uuids::EOG_NOTIFY_CHARACTERISTIC, self.eog_tx.clone())
            .await?;

        Ok(())
    }

    fn spawn_rssi_poll(&self, device_id: String, token: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let interval = self.config.rssi_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if state.lock().await.device.is_none() {
                            break;
                        }
                        if let Ok(rssi) = transport.read_rssi(&device_id).await {
                            state.lock().await.rssi = rssi;
                        }
                    }
                }
            }
        });
    }

    async fn spawn_disconnect_watcher(&self, device_id: String, token: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<bool>(1);
        self.transport.watch_disconnect(&device_id, tx).await;

        let manager = self.clone();
        tokio::spawn(async move {
            let unexpected = tokio::select! {
                _ = token.cancelled() => return,
                msg = rx.recv() => msg.unwrap_or(false),
            };

            log_warn!("link to {device_id} lost (unexpected: {unexpected})");
            {
                let mut st = manager.state.lock().await;
                st.reset_link();
                st.last_error = Some(LinkError::LinkLost.to_string());
            }
            if let Some(link_token) = manager.link_tasks.lock().await.take() {
                link_token.cancel();
            }

            if unexpected && manager.config.auto_reconnect {
                manager.schedule_reconnect(device_id).await;
            }
        });
    }

    // Boxed return type (not an `async fn`) to break the Send-inference
    // cycle through connect -> watcher -> reconnect -> connect.
    fn schedule_reconnect(
        &self,
        device_id: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let this = self.clone();
        Box::pin(async move {
        this.cancel_reconnect().await;
        let token = CancellationToken::new();
        *this.reconnect.lock().await = Some(token.clone());

        let manager = this.clone();
        let delay = this.config.reconnect_delay;
        log_info!("reconnecting to {device_id} in {delay:?}");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Boxed to cut the connect -> watcher -> reconnect ->
                    // connect cycle in the inferred future types.
                    let attempt: Pin<Box<dyn Future<Output = Result<(), LinkError>> + Send>> =
                        Box::pin(async move {
                            let result = manager.connect(&device_id).await;
                            if let Err(err) = &result {
                                log_warn!("auto-reconnect to {device_id} failed: {err}");
                            }
                            result
                        });
                    let _ = attempt.await;
                }
            }
        });
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> LinkConfig {
        LinkConfig {
            scan_timeout: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(20),
            rssi_interval: Duration::from_millis(10),
            auto_reconnect: true,
        }
    }

    fn manager(transport: Arc<MockTransport>) -> (tempfile::TempDir, DeviceLinkManager<MockTransport>) {
        let dir = tempdir().unwrap();
        let settings =
            Arc::new(SettingsStore::new(dir.path().join("settings.json")).unwrap());
        let manager = DeviceLinkManager::new(transport, settings, test_config());
        (dir, manager)
    }

    #[tokio::test]
    async fn second_connect_supersedes_inflight_attempt() {
        let transport = Arc::new(MockTransport::new());
        transport
            .connect_delays
            .lock()
            .unwrap()
            .insert("A".into(), Duration::from_millis(40));
        let (_dir, manager) = manager(Arc::clone(&transport));

        let slow = manager.clone();
        let handle = tokio::spawn(async move { slow.connect("A").await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.connect("B").await.unwrap();
        handle.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*transport.connected.lock().unwrap(), vec!["B".to_string()]);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.device.as_ref().map(|d| d.id.as_str()), Some("B"));

        // No duplicate characteristic subscriptions from the discarded attempt.
        let subs = transport.subscriptions.lock().unwrap();
        assert!(subs.iter().all(|(id, _)| id == "B"));
        assert_eq!(subs.len(), 3);
    }

    #[tokio::test]
    async fn explicit_disconnect_suppresses_auto_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let (_dir, manager) = manager(Arc::clone(&transport));

        manager.connect("A").await.unwrap();
        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!manager.snapshot().await.connected);
    }

    #[tokio::test]
    async fn unexpected_drop_schedules_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let (_dir, manager) = manager(Arc::clone(&transport));

        manager.connect("A").await.unwrap();
        transport.drop_link("A", true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.device.as_ref().map(|d| d.id.as_str()), Some("A"));
    }

    #[tokio::test]
    async fn scan_dedups_by_id_and_auto_stops() {
        let transport = Arc::new(MockTransport::new());
        let (_dir, manager) = manager(Arc::clone(&transport));

        manager.start_scan().await.unwrap();
        transport
            .emit_scanned(ScannedDevice { id: "A".into(), name: None, rssi: -70 })
            .await;
        transport
            .emit_scanned(ScannedDevice {
                id: "A".into(),
                name: Some("eog-band".into()),
                rssi: -52,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = manager.snapshot().await;
        assert!(snapshot.scanning);
        assert_eq!(snapshot.scanned_devices.len(), 1);
        assert_eq!(snapshot.scanned_devices[0].rssi, -52);

        // Auto-stop after the configured timeout.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.snapshot().await.scanning);
    }

    #[tokio::test]
    async fn connect_to_remembered_uses_most_recent() {
        let transport = Arc::new(MockTransport::new());
        let (_dir, manager) = manager(Arc::clone(&transport));

        manager.remember_device("old").await.unwrap();
        manager.remember_device("new").await.unwrap();
        manager.connect_to_remembered().await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.device.as_ref().map(|d| d.id.as_str()), Some("new"));
    }

    #[tokio::test]
    async fn telemetry_notifications_update_snapshot() {
        let transport = Arc::new(MockTransport::new());
        let (_dir, manager) = manager(Arc::clone(&transport));

        manager.connect("A").await.unwrap();
        transport
            .emit_notification(
                uuids::GYRO_CHARACTERISTIC,
                br#"{"pitch": 1.5, "roll": -2.0, "yaw": 10.0}"#.to_vec(),
            )
            .await;
        transport
            .emit_notification(uuids::BATTERY_CHARACTERISTIC, b"87".to_vec())
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.gyro.pitch, 1.5);
        assert_eq!(snapshot.battery_level, 87);
    }
}
