//! Effective-config composition: how mode, live speed and weather combine
//! into the alarm delay and eye-closure threshold used on every frame.

use crate::providers::WeatherCondition;
use crate::settings::{CustomConfig, SafetyMode, DEFAULT_EYE_THRESHOLD};

pub const SMOOTH_ALPHA: f32 = 0.35;
pub const STOP_THRESHOLD_OFFSET: f32 = 0.10;
pub const FACE_TIMEOUT_MS: u64 = 1500;

pub const CLEAR_WEATHER_DELAY_MS: u64 = 2500;
pub const SEVERE_WEATHER_DELAY_MS: u64 = 1500;

pub const SLOW_TRAFFIC_DELAY_MS: u64 = 4000;
pub const INTERMEDIATE_SPEED_DELAY_MS: u64 = 2000;
pub const HIGH_SPEED_DELAY_MS: u64 = 1500;

pub const CALIBRATION_MIN_SAMPLES: usize = 6;
pub const CALIBRATION_THRESHOLD_FLOOR: f32 = 0.15;
pub const CALIBRATION_THRESHOLD_CEIL: f32 = 0.80;

/// Derived per-frame configuration; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveConfig {
    pub require_driving: bool,
    pub alarm_after_ms: u64,
    pub eye_closed_threshold: f32,
}

pub fn weather_delay_ms(condition: WeatherCondition) -> u64 {
    match condition {
        WeatherCondition::Severe => SEVERE_WEATHER_DELAY_MS,
        WeatherCondition::Normal => CLEAR_WEATHER_DELAY_MS,
    }
}

/// Speed-bracket delay. Mid-range speeds (20..80) carry no opinion and
/// inherit the weather base.
pub fn speed_delay_ms(speed_kmh: f64, weather_base_ms: u64) -> u64 {
    if speed_kmh < 20.0 {
        SLOW_TRAFFIC_DELAY_MS
    } else if speed_kmh >= 100.0 {
        HIGH_SPEED_DELAY_MS
    } else if speed_kmh >= 80.0 {
        INTERMEDIATE_SPEED_DELAY_MS
    } else {
        weather_base_ms
    }
}

/// The shorter delay wins: poor visibility and high speed each
/// independently raise the risk.
pub fn effective_delay_ms(condition: WeatherCondition, speed_kmh: f64) -> u64 {
    let weather = weather_delay_ms(condition);
    weather.min(speed_delay_ms(speed_kmh, weather))
}

/// Composes the per-frame config. The eye threshold is a single global
/// value in every mode; only custom mode applies the user delay as an
/// additional floor via `min`.
pub fn effective_config(
    mode: SafetyMode,
    custom: &CustomConfig,
    global_threshold: f32,
    condition: WeatherCondition,
    speed_kmh: f64,
) -> EffectiveConfig {
    let threshold = if global_threshold > 0.0 {
        global_threshold
    } else {
        DEFAULT_EYE_THRESHOLD
    };
    let base = effective_delay_ms(condition, speed_kmh);

    match mode {
        SafetyMode::Driving => EffectiveConfig {
            require_driving: true,
            alarm_after_ms: base,
            eye_closed_threshold: threshold,
        },
        SafetyMode::Study => EffectiveConfig {
            require_driving: false,
            alarm_after_ms: base,
            eye_closed_threshold: threshold,
        },
        SafetyMode::Custom => EffectiveConfig {
            require_driving: custom.require_driving,
            alarm_after_ms: custom.alarm_after_ms.min(base),
            eye_closed_threshold: threshold,
        },
    }
}

/// Detector probabilities arrive in [0,1] or occasionally as percentages.
/// Non-numeric garbage reads as "open".
pub fn clamp01(value: f32) -> f32 {
    if !value.is_finite() {
        return 1.0;
    }
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.clamp(0.0, 1.0)
}

/// New threshold from calibration samples, or `None` when too few samples
/// were collected and the previous threshold should stand.
pub fn calibrated_threshold(samples: &[f32]) -> Option<f32> {
    if samples.len() < CALIBRATION_MIN_SAMPLES {
        return None;
    }
    let avg = samples.iter().sum::<f32>() / samples.len() as f32;
    Some((avg * 0.5).clamp(CALIBRATION_THRESHOLD_FLOOR, CALIBRATION_THRESHOLD_CEIL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_delay_is_min_of_weather_and_speed() {
        for &condition in &[WeatherCondition::Normal, WeatherCondition::Severe] {
            for &speed in &[0.0, 10.0, 20.0, 50.0, 80.0, 99.9, 100.0, 140.0] {
                let weather = weather_delay_ms(condition);
                let expected = weather.min(speed_delay_ms(speed, weather));
                assert_eq!(effective_delay_ms(condition, speed), expected);
            }
        }
    }

    #[test]
    fn speed_brackets_match_documented_boundaries() {
        let base = CLEAR_WEATHER_DELAY_MS;
        assert_eq!(speed_delay_ms(10.0, base), 4000);
        assert_eq!(speed_delay_ms(19.9, base), 4000);
        assert_eq!(speed_delay_ms(20.0, base), base);
        assert_eq!(speed_delay_ms(79.9, base), base);
        assert_eq!(speed_delay_ms(80.0, base), 2000);
        assert_eq!(speed_delay_ms(99.9, base), 2000);
        assert_eq!(speed_delay_ms(100.0, base), 1500);
    }

    #[test]
    fn slowing_down_from_90_to_10_relaxes_the_delay() {
        let at_90 = effective_delay_ms(WeatherCondition::Normal, 90.0);
        let at_10 = effective_delay_ms(WeatherCondition::Normal, 10.0);
        assert_eq!(at_90, 2000);
        assert!(at_10 > at_90);
    }

    #[test]
    fn severe_weather_wins_over_slow_traffic() {
        assert_eq!(effective_delay_ms(WeatherCondition::Severe, 10.0), 1500);
        assert_eq!(effective_delay_ms(WeatherCondition::Severe, 50.0), 1500);
    }

    #[test]
    fn custom_mode_applies_user_delay_as_extra_floor() {
        let custom = CustomConfig {
            require_driving: false,
            alarm_after_ms: 1000,
            eye_closed_threshold: 0.5,
        };
        let cfg = effective_config(
            SafetyMode::Custom,
            &custom,
            0.38,
            WeatherCondition::Normal,
            50.0,
        );
        assert_eq!(cfg.alarm_after_ms, 1000);
        assert!(!cfg.require_driving);
        // Global threshold applies even in custom mode.
        assert!((cfg.eye_closed_threshold - 0.38).abs() < f32::EPSILON);

        let relaxed = CustomConfig {
            alarm_after_ms: 9000,
            ..custom
        };
        let cfg = effective_config(
            SafetyMode::Custom,
            &relaxed,
            0.38,
            WeatherCondition::Normal,
            50.0,
        );
        assert_eq!(cfg.alarm_after_ms, 2500);
    }

    #[test]
    fn driving_and_study_modes_ignore_user_delay() {
        let custom = CustomConfig {
            require_driving: false,
            alarm_after_ms: 100,
            eye_closed_threshold: 0.9,
        };
        let driving = effective_config(
            SafetyMode::Driving,
            &custom,
            0.38,
            WeatherCondition::Normal,
            50.0,
        );
        assert!(driving.require_driving);
        assert_eq!(driving.alarm_after_ms, 2500);

        let study = effective_config(
            SafetyMode::Study,
            &custom,
            0.38,
            WeatherCondition::Normal,
            50.0,
        );
        assert!(!study.require_driving);
        assert_eq!(study.alarm_after_ms, 2500);
    }

    #[test]
    fn clamp01_normalizes_percentages_and_garbage() {
        assert_eq!(clamp01(0.5), 0.5);
        assert_eq!(clamp01(85.0), 0.85);
        assert_eq!(clamp01(-0.2), 0.0);
        assert_eq!(clamp01(f32::NAN), 1.0);
        assert_eq!(clamp01(f32::INFINITY), 1.0);
    }

    #[test]
    fn calibration_needs_at_least_six_samples() {
        assert_eq!(calibrated_threshold(&[0.9; 5]), None);

        let threshold = calibrated_threshold(&[0.9; 10]).unwrap();
        assert!((threshold - 0.45).abs() < 1e-6);

        // Clamped to the documented band.
        assert_eq!(calibrated_threshold(&[0.1; 10]), Some(0.15));
        assert_eq!(calibrated_threshold(&[2.0; 10]), Some(0.80));
    }
}
