use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

/// Remembered-device slots; adding a third evicts the oldest.
const MAX_REMEMBERED_DEVICES: usize = 2;

pub const DEFAULT_EYE_THRESHOLD: f32 = 0.38;
pub const DEFAULT_ALARM_AFTER_MS: u64 = 2500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SafetyMode {
    Driving,
    Study,
    Custom,
}

impl Default for SafetyMode {
    fn default() -> Self {
        SafetyMode::Driving
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub require_driving: bool,
    pub alarm_after_ms: u64,
    pub eye_closed_threshold: f32,
}

impl Default for CustomConfig {
    fn default() -> Self {
        Self {
            require_driving: true,
            alarm_after_ms: DEFAULT_ALARM_AFTER_MS,
            eye_closed_threshold: DEFAULT_EYE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSettings {
    emergency_contact: String,
    strobe_enabled: bool,
    eye_threshold: f32,
    remembered_devices: Vec<String>,
    preferred_mode: SafetyMode,
    custom: CustomConfig,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            emergency_contact: String::new(),
            strobe_enabled: true,
            eye_threshold: DEFAULT_EYE_THRESHOLD,
            remembered_devices: Vec::new(),
            preferred_mode: SafetyMode::Driving,
            custom: CustomConfig::default(),
        }
    }
}

/// JSON-file-backed store for the small set of state the core persists:
/// remembered device ids, the calibrated eye threshold, the strobe flag and
/// the emergency contact.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn emergency_contact(&self) -> String {
        self.data.read().unwrap().emergency_contact.clone()
    }

    pub fn set_emergency_contact(&self, contact: &str) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.emergency_contact = contact.trim().to_string();
        self.persist(&guard)
    }

    pub fn strobe_enabled(&self) -> bool {
        self.data.read().unwrap().strobe_enabled
    }

    pub fn set_strobe_enabled(&self, enabled: bool) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.strobe_enabled = enabled;
        self.persist(&guard)
    }

    pub fn eye_threshold(&self) -> f32 {
        self.data.read().unwrap().eye_threshold
    }

    pub fn set_eye_threshold(&self, threshold: f32) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.eye_threshold = threshold;
        self.persist(&guard)
    }

    pub fn preferred_mode(&self) -> SafetyMode {
        self.data.read().unwrap().preferred_mode
    }

    pub fn set_preferred_mode(&self, mode: SafetyMode) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.preferred_mode = mode;
        self.persist(&guard)
    }

    pub fn custom_config(&self) -> CustomConfig {
        self.data.read().unwrap().custom.clone()
    }

    pub fn set_custom_config(&self, custom: CustomConfig) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.custom = custom;
        self.persist(&guard)
    }

    pub fn remembered_devices(&self) -> Vec<String> {
        self.data.read().unwrap().remembered_devices.clone()
    }

    /// Most recently remembered device, if any. This is the one
    /// `connect_to_remembered` tries at startup.
    pub fn last_remembered_device(&self) -> Option<String> {
        self.data.read().unwrap().remembered_devices.last().cloned()
    }

    /// Adds a device id to the remembered set. Keeps at most
    /// [`MAX_REMEMBERED_DEVICES`] entries, evicting the oldest first.
    /// Remembering an already-known id is a no-op.
    pub fn remember_device(&self, device_id: &str) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        if guard.remembered_devices.iter().any(|id| id == device_id) {
            return Ok(());
        }
        guard.remembered_devices.push(device_id.to_string());
        while guard.remembered_devices.len() > MAX_REMEMBERED_DEVICES {
            guard.remembered_devices.remove(0);
        }
        self.persist(&guard)
    }

    pub fn forget_device(&self, device_id: &str) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.remembered_devices.retain(|id| id != device_id);
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn remembered_devices_evict_oldest_beyond_two() {
        let (_dir, store) = store();
        store.remember_device("aa").unwrap();
        store.remember_device("bb").unwrap();
        store.remember_device("cc").unwrap();

        assert_eq!(store.remembered_devices(), vec!["bb", "cc"]);
        assert_eq!(store.last_remembered_device().as_deref(), Some("cc"));
    }

    #[test]
    fn remembering_known_device_is_noop() {
        let (_dir, store) = store();
        store.remember_device("aa").unwrap();
        store.remember_device("bb").unwrap();
        store.remember_device("aa").unwrap();

        assert_eq!(store.remembered_devices(), vec!["aa", "bb"]);
    }

    #[test]
    fn settings_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let store = SettingsStore::new(path.clone()).unwrap();
            store.set_emergency_contact(" +351912345678 ").unwrap();
            store.set_eye_threshold(0.42).unwrap();
            store.set_strobe_enabled(false).unwrap();
        }

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.emergency_contact(), "+351912345678");
        assert!((store.eye_threshold() - 0.42).abs() < f32::EPSILON);
        assert!(!store.strobe_enabled());
    }

    #[test]
    fn forget_removes_only_requested_device() {
        let (_dir, store) = store();
        store.remember_device("aa").unwrap();
        store.remember_device("bb").unwrap();
        store.forget_device("aa").unwrap();

        assert_eq!(store.remembered_devices(), vec!["bb"]);
    }
}
