//! Per-frame eye-closure fusion: smoothing, hysteresis and closure timing.
//!
//! The engine is pure state plus a frame function; time comes in as a
//! parameter and the async sampler owns the clock. This keeps the trigger
//! logic testable without a runtime.

use serde::Serialize;

use super::config::{
    clamp01, calibrated_threshold, EffectiveConfig, FACE_TIMEOUT_MS, SMOOTH_ALPHA,
    STOP_THRESHOLD_OFFSET,
};

/// Fixed detector-result contract: per-eye open probabilities for the most
/// prominent face in the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceFrame {
    pub left_eye_open: f32,
    pub right_eye_open: f32,
}

/// Outcome of feeding one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameVerdict {
    /// Camera inactive; frame dropped.
    Ignored,
    Updated,
    /// Closure duration crossed the effective delay.
    Trigger {
        duration_ms: u64,
        effective_delay_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionSnapshot {
    pub camera_active: bool,
    pub face_detected: bool,
    pub left_eye_open: f32,
    pub right_eye_open: f32,
    pub is_eyes_closed: bool,
    pub eyes_closed_duration_ms: u64,
    pub night_run: bool,
    pub calibrating: bool,
    pub calibration_progress: u8,
}

pub struct FusionEngine {
    camera_active: bool,
    /// Front cameras mirror the image, so left and right swap.
    front_camera: bool,
    left_smooth: f32,
    right_smooth: f32,
    eyes_closed_since_ms: Option<u64>,
    last_face_seen_ms: Option<u64>,
    face_detected: bool,
    is_eyes_closed: bool,
    closed_duration_ms: u64,
    night_run: bool,
    calibration_samples: Option<Vec<f32>>,
    calibration_progress: u8,
}

impl FusionEngine {
    pub fn new(front_camera: bool) -> Self {
        Self {
            camera_active: false,
            front_camera,
            left_smooth: 1.0,
            right_smooth: 1.0,
            eyes_closed_since_ms: None,
            last_face_seen_ms: None,
            face_detected: false,
            is_eyes_closed: false,
            closed_duration_ms: 0,
            night_run: false,
            calibration_samples: None,
            calibration_progress: 0,
        }
    }

    /// Starts monitoring and derives the automatic night flag from the
    /// local hour.
    pub fn start_camera(&mut self, local_hour: u32) {
        self.reset_tracking();
        self.camera_active = true;
        self.night_run = local_hour >= 20 || local_hour < 7;
    }

    /// Stops frame intake without resetting tracking state.
    pub fn pause_camera(&mut self) {
        self.camera_active = false;
    }

    pub fn stop_camera(&mut self) {
        self.reset_tracking();
        self.camera_active = false;
    }

    pub fn is_camera_active(&self) -> bool {
        self.camera_active
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            camera_active: self.camera_active,
            face_detected: self.face_detected,
            left_eye_open: self.left_smooth,
            right_eye_open: self.right_smooth,
            is_eyes_closed: self.is_eyes_closed,
            eyes_closed_duration_ms: self.closed_duration_ms,
            night_run: self.night_run,
            calibrating: self.calibration_samples.is_some(),
            calibration_progress: self.calibration_progress,
        }
    }

    /// Feeds one sampled frame. `None` means no face was found in it.
    pub fn on_frame(
        &mut self,
        frame: Option<FaceFrame>,
        now_ms: u64,
        config: &EffectiveConfig,
        alarm_active: bool,
    ) -> FrameVerdict {
        if !self.camera_active {
            return FrameVerdict::Ignored;
        }

        if let Some(samples) = &mut self.calibration_samples {
            if let Some(face) = frame {
                let avg = (clamp01(face.left_eye_open) + clamp01(face.right_eye_open)) / 2.0;
                samples.push(avg);
            }
            return FrameVerdict::Updated;
        }

        let Some(face) = frame else {
            // Face lost: only reset once it has been gone past the timeout,
            // so a single dropped detection does not wipe closure timing.
            if let Some(last_seen) = self.last_face_seen_ms {
                if now_ms.saturating_sub(last_seen) > FACE_TIMEOUT_MS {
                    self.eyes_closed_since_ms = None;
                    self.face_detected = false;
                    self.left_smooth = 1.0;
                    self.right_smooth = 1.0;
                    self.is_eyes_closed = false;
                    self.closed_duration_ms = 0;
                }
            }
            return FrameVerdict::Updated;
        };

        self.last_face_seen_ms = Some(now_ms);

        let raw_left = clamp01(face.left_eye_open);
        let raw_right = clamp01(face.right_eye_open);
        let (raw_left, raw_right) = if self.front_camera {
            (raw_right, raw_left)
        } else {
            (raw_left, raw_right)
        };

        self.left_smooth = self.left_smooth * (1.0 - SMOOTH_ALPHA) + raw_left * SMOOTH_ALPHA;
        self.right_smooth = self.right_smooth * (1.0 - SMOOTH_ALPHA) + raw_right * SMOOTH_ALPHA;

        let start_threshold = config.eye_closed_threshold;
        let stop_threshold = (start_threshold + STOP_THRESHOLD_OFFSET).min(1.0);

        let closed_now =
            self.left_smooth < start_threshold || self.right_smooth < start_threshold;
        let open_now =
            self.left_smooth > stop_threshold && self.right_smooth > stop_threshold;

        self.face_detected = true;

        if open_now {
            self.eyes_closed_since_ms = None;
            self.is_eyes_closed = false;
            self.closed_duration_ms = 0;
            return FrameVerdict::Updated;
        }

        if closed_now && self.eyes_closed_since_ms.is_none() {
            self.eyes_closed_since_ms = Some(now_ms);
        }

        let Some(since) = self.eyes_closed_since_ms else {
            // Hysteresis band entered from open: neither threshold has been
            // crossed, so the eyes are still judged open. Closed is only
            // ever reported with a live closure timestamp.
            self.is_eyes_closed = false;
            self.closed_duration_ms = 0;
            return FrameVerdict::Updated;
        };

        let duration_ms = now_ms.saturating_sub(since);
        self.is_eyes_closed = true;
        self.closed_duration_ms = duration_ms;

        if alarm_active {
            // Keep the display state fresh but never re-trigger mid-alarm.
            return FrameVerdict::Updated;
        }

        if duration_ms >= config.alarm_after_ms {
            return FrameVerdict::Trigger {
                duration_ms,
                effective_delay_ms: config.alarm_after_ms,
            };
        }
        FrameVerdict::Updated
    }

    pub fn start_calibration(&mut self) {
        self.calibration_samples = Some(Vec::new());
        self.calibration_progress = 0;
    }

    pub fn set_calibration_progress(&mut self, progress: u8) {
        self.calibration_progress = progress.min(100);
    }

    pub fn cancel_calibration(&mut self) {
        self.calibration_samples = None;
        self.calibration_progress = 0;
    }

    /// Ends calibration, returning the new threshold or `None` when too few
    /// samples were collected (previous threshold stands).
    pub fn finish_calibration(&mut self) -> Option<f32> {
        let samples = self.calibration_samples.take()?;
        self.calibration_progress = 100;
        calibrated_threshold(&samples)
    }

    fn reset_tracking(&mut self) {
        self.left_smooth = 1.0;
        self.right_smooth = 1.0;
        self.eyes_closed_since_ms = None;
        self.last_face_seen_ms = None;
        self.face_detected = false;
        self.is_eyes_closed = false;
        self.closed_duration_ms = 0;
    }
}
