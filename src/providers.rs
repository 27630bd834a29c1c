//! Collaborator interfaces consumed by the core engines.
//!
//! Location, weather, native actuation, trip logging and voice prompts are
//! thin platform glue outside this crate; the engines only see these traits.

use anyhow::Result;
use serde::{Deserialize, Serialize};

const ENABLE_LOGS: bool = true;
use crate::log_warn;

/// Speed threshold above which we treat the user as driving even when the
/// platform's activity recognition has not flipped `is_driving` yet.
const DRIVING_SPEED_KMH: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSnapshot {
    /// Current speed in meters per second, as reported by the platform.
    pub speed_mps: f64,
    /// Platform-level "in vehicle" classification.
    pub is_driving: bool,
    pub coordinates: Option<Coordinates>,
}

impl LocationSnapshot {
    pub fn speed_kmh(&self) -> f64 {
        self.speed_mps * 3.6
    }

    /// Driving heuristic: either the platform says so, or we are moving
    /// faster than a walking/cycling pace.
    pub fn is_driving_now(&self) -> bool {
        self.is_driving || self.speed_kmh() > DRIVING_SPEED_KMH
    }
}

pub trait LocationProvider: Send + Sync {
    fn snapshot(&self) -> LocationSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeatherCondition {
    Normal,
    Severe,
}

pub trait WeatherProvider: Send + Sync {
    fn condition(&self) -> WeatherCondition;
}

/// Maps a WMO weather code to the coarse classification the threshold
/// engine consumes. Severe covers fog, rain/drizzle, snow, showers and
/// thunderstorms.
pub fn classify_wmo(code: u16) -> WeatherCondition {
    let severe = matches!(code, 45 | 48) || (51..=67).contains(&code)
        || (71..=82).contains(&code)
        || (95..=99).contains(&code);
    if severe {
        WeatherCondition::Severe
    } else {
        WeatherCondition::Normal
    }
}

/// Native actuation surface used by the alarm escalation sequence.
///
/// Every method is fire-and-forget: it reports success or failure, and the
/// caller treats failures as log-and-continue. Implementations for platforms
/// missing a capability should warn and return `Ok(())`.
pub trait Actuation: Send + Sync {
    fn set_max_volume(&self) -> Result<()>;
    /// `via_car_audio` requests routing through the car's hands-free profile
    /// when available; implementations fall back to the phone speaker.
    fn play_alarm(&self, via_car_audio: bool) -> Result<()>;
    fn stop_alarm(&self) -> Result<()>;
    fn start_strobe(&self) -> Result<()>;
    fn stop_strobe(&self) -> Result<()>;
    fn call_phone(&self, number: &str) -> Result<()>;
    /// Fallback when direct dialing is unsupported: hand the number to the
    /// system dialer UI.
    fn open_dialer(&self, number: &str) -> Result<()>;
    fn send_sms(&self, number: &str, message: &str) -> Result<()>;
}

/// Actuation backend for platforms with none of the native capabilities.
/// Each call is a no-op with a logged warning, so the escalation sequence
/// still runs end to end.
pub struct NullActuation;

impl Actuation for NullActuation {
    fn set_max_volume(&self) -> Result<()> {
        log_warn!("set_max_volume: no volume control on this platform");
        Ok(())
    }

    fn play_alarm(&self, via_car_audio: bool) -> Result<()> {
        log_warn!("play_alarm(car_audio={via_car_audio}): no audio backend");
        Ok(())
    }

    fn stop_alarm(&self) -> Result<()> {
        Ok(())
    }

    fn start_strobe(&self) -> Result<()> {
        log_warn!("start_strobe: no flashlight on this platform");
        Ok(())
    }

    fn stop_strobe(&self) -> Result<()> {
        Ok(())
    }

    fn call_phone(&self, number: &str) -> Result<()> {
        log_warn!("call_phone({number}): telephony unavailable");
        Ok(())
    }

    fn open_dialer(&self, number: &str) -> Result<()> {
        log_warn!("open_dialer({number}): telephony unavailable");
        Ok(())
    }

    fn send_sms(&self, number: &str, message: &str) -> Result<()> {
        log_warn!("send_sms({number}): telephony unavailable ({} chars)", message.len());
        Ok(())
    }
}

/// Append-only per-trip event sink. Consumed, not owned, by the alarm engine.
pub trait TripLog: Send + Sync {
    fn increment_alert_count(&self);
}

/// Text-to-speech seam for the cognitive attention checks. The dialogue
/// content and speech recognition live outside the core.
pub trait VoicePrompt: Send + Sync {
    fn speak(&self, text: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmo_fog_and_rain_are_severe() {
        assert_eq!(classify_wmo(45), WeatherCondition::Severe);
        assert_eq!(classify_wmo(48), WeatherCondition::Severe);
        assert_eq!(classify_wmo(51), WeatherCondition::Severe);
        assert_eq!(classify_wmo(67), WeatherCondition::Severe);
        assert_eq!(classify_wmo(82), WeatherCondition::Severe);
        assert_eq!(classify_wmo(95), WeatherCondition::Severe);
        assert_eq!(classify_wmo(99), WeatherCondition::Severe);
    }

    #[test]
    fn wmo_clear_sky_is_normal() {
        assert_eq!(classify_wmo(0), WeatherCondition::Normal);
        assert_eq!(classify_wmo(2), WeatherCondition::Normal);
        assert_eq!(classify_wmo(85), WeatherCondition::Normal);
    }

    #[test]
    fn driving_heuristic_uses_speed_fallback() {
        let stopped = LocationSnapshot::default();
        assert!(!stopped.is_driving_now());

        let fast = LocationSnapshot {
            speed_mps: 25.0,
            is_driving: false,
            coordinates: None,
        };
        assert!(fast.is_driving_now());

        let flagged = LocationSnapshot {
            speed_mps: 0.0,
            is_driving: true,
            coordinates: None,
        };
        assert!(flagged.is_driving_now());
    }
}
