//! Radio abstraction consumed by the link manager.
//!
//! The crate does not implement BLE itself; a platform adapter implements
//! [`BleTransport`] over whatever native stack is available. Tests and the
//! simulator use in-process implementations.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Service/characteristic identifiers. The exact values are a deployment
/// detail but must match the wearable firmware.
pub mod uuids {
    /// Primary telemetry service.
    pub const TELEMETRY_SERVICE: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";
    /// Notify, JSON `{pitch, roll, yaw}` in degrees.
    pub const GYRO_CHARACTERISTIC: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";
    /// Notify, single integer 0-100.
    pub const BATTERY_CHARACTERISTIC: &str = "00002a19-0000-1000-8000-00805f9b34fb";
    /// Nordic-UART-style service carrying the EOG line protocol.
    pub const EOG_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    /// Write: single-character commands, Base64-wrapped.
    pub const EOG_WRITE_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    /// Notify: ASCII status lines or bracketed arrays, Base64-wrapped.
    pub const EOG_NOTIFY_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
}

#[derive(Debug, Error)]
pub enum LinkError {
    /// User-actionable and non-fatal: the app lacks Bluetooth permission.
    #[error("bluetooth permission denied")]
    PermissionDenied,
    /// The radio is powered off; connected state is forced to false.
    #[error("bluetooth radio unavailable")]
    RadioUnavailable,
    #[error("link lost unexpectedly")]
    LinkLost,
    #[error("no device connected")]
    NotConnected,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    /// Both the fire-and-forget and the acknowledged transport mode failed.
    #[error("command write failed: {0}")]
    CommandWriteFailure(String),
}

/// A device seen during discovery. Rebuilt every scan cycle; keyed by id
/// with last-seen-wins semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
}

/// Opaque handle to a connected peripheral. Owned by the link manager
/// while connected; dropped on disconnect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHandle {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fire-and-forget; preferred because it cannot stall the link.
    WithoutResponse,
    /// Acknowledged; used as the retry path when the first write fails.
    WithResponse,
}

/// Asynchronous radio operations. All calls suspend the caller without
/// blocking the runtime; the manager serializes access to the single link.
///
/// Methods are declared in desugared form so the returned futures are
/// `Send`: the manager awaits them inside spawned tasks on a multi-threaded
/// runtime. Implementations can still use plain `async fn`.
pub trait BleTransport: Send + Sync + 'static {
    /// Begins discovery, pushing devices into `found` until `stop_scan`.
    fn start_scan(
        &self,
        found: mpsc::Sender<ScannedDevice>,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = ()> + Send;

    fn connect(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<DeviceHandle, LinkError>> + Send;

    fn disconnect(&self, device_id: &str) -> impl Future<Output = ()> + Send;

    /// Subscribes to a notify characteristic, forwarding raw payloads into
    /// `sink`. The transport drops the sender when the link goes down, which
    /// ends the consumer loop.
    fn subscribe(
        &self,
        device_id: &str,
        characteristic: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn write(
        &self,
        device_id: &str,
        characteristic: &str,
        payload: &[u8],
        mode: WriteMode,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn read_rssi(&self, device_id: &str) -> impl Future<Output = Result<i16, LinkError>> + Send;

    /// Registers a one-shot disconnect watcher for the device. The payload
    /// is `true` when the loss was unexpected (not caused by an explicit
    /// disconnect).
    fn watch_disconnect(
        &self,
        device_id: &str,
        notify: mpsc::Sender<bool>,
    ) -> impl Future<Output = ()> + Send;
}
