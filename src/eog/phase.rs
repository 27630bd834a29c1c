//! Pure phase machine for the wearable's calibration/run lifecycle.
//!
//! Transitions are driven by exactly three inputs: the single main button,
//! a countdown reaching zero, and inbound status lines. The async engine
//! applies the transitions; nothing here touches the transport or timers.

use serde::Serialize;

use super::codec::Command;

pub const CALIBRATION_STEP_SECS: u32 = 10;
pub const BASELINE_SECS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CalibrationStage {
    /// First 10 seconds: keep the eyes still.
    HoldStill,
    /// Second 10 seconds: blink at a normal pace.
    Blink,
    /// Waiting for the device's verdict; no countdown.
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolPhase {
    Idle,
    Calibrating(CalibrationStage),
    ReadyToBlink,
    Baseline,
    ReadyToStart,
    Running,
    Done,
    Error,
}

/// What a main-button press does in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonTransition {
    pub command: Command,
    pub next: ProtocolPhase,
    pub countdown_secs: Option<u32>,
    /// Aborts reset local state even when the command write fails.
    pub is_abort: bool,
}

impl ProtocolPhase {
    /// Countdowns exist only while calibrating or recording the baseline.
    pub fn allows_countdown(self) -> bool {
        matches!(self, ProtocolPhase::Calibrating(_) | ProtocolPhase::Baseline)
    }

    pub fn on_main_button(self) -> Option<ButtonTransition> {
        use ProtocolPhase::*;
        match self {
            Idle | Error => Some(ButtonTransition {
                command: Command::Calibrate,
                next: Calibrating(CalibrationStage::HoldStill),
                countdown_secs: Some(CALIBRATION_STEP_SECS),
                is_abort: false,
            }),
            ReadyToBlink => Some(ButtonTransition {
                command: Command::Baseline,
                next: Baseline,
                countdown_secs: Some(BASELINE_SECS),
                is_abort: false,
            }),
            ReadyToStart | Done => Some(ButtonTransition {
                command: Command::Start,
                next: Running,
                countdown_secs: None,
                is_abort: false,
            }),
            Calibrating(_) | Baseline => Some(ButtonTransition {
                command: Command::Abort,
                next: Idle,
                countdown_secs: None,
                is_abort: true,
            }),
            Running => Some(ButtonTransition {
                command: Command::Abort,
                next: ReadyToStart,
                countdown_secs: None,
                is_abort: true,
            }),
        }
    }

    /// Applied when the active countdown hits zero. Returns the next phase
    /// and the follow-up countdown, if the chain continues.
    pub fn on_countdown_finished(self) -> Option<(ProtocolPhase, Option<u32>)> {
        use ProtocolPhase::*;
        match self {
            Calibrating(CalibrationStage::HoldStill) => Some((
                Calibrating(CalibrationStage::Blink),
                Some(CALIBRATION_STEP_SECS),
            )),
            Calibrating(CalibrationStage::Blink) => {
                Some((Calibrating(CalibrationStage::Processing), None))
            }
            Baseline => Some((ReadyToStart, None)),
            _ => None,
        }
    }

    /// Inbound "malformed/retry" status line.
    pub fn on_failure_line(self) -> Option<ProtocolPhase> {
        match self {
            ProtocolPhase::Calibrating(CalibrationStage::Processing) => Some(ProtocolPhase::Idle),
            _ => None,
        }
    }

    /// Inbound "success/complete" status line.
    pub fn on_success_line(self) -> Option<ProtocolPhase> {
        match self {
            ProtocolPhase::Calibrating(CalibrationStage::Processing) => {
                Some(ProtocolPhase::ReadyToBlink)
            }
            ProtocolPhase::Running => Some(ProtocolPhase::Done),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolPhase::*;

    #[test]
    fn main_button_starts_calibration_from_idle() {
        let transition = Idle.on_main_button().unwrap();
        assert_eq!(transition.command, Command::Calibrate);
        assert_eq!(transition.next, Calibrating(CalibrationStage::HoldStill));
        assert_eq!(transition.countdown_secs, Some(10));
        assert!(!transition.is_abort);
    }

    #[test]
    fn main_button_aborts_running_back_to_ready() {
        let transition = Running.on_main_button().unwrap();
        assert_eq!(transition.command, Command::Abort);
        assert_eq!(transition.next, ReadyToStart);
        assert!(transition.is_abort);

        let transition = Baseline.on_main_button().unwrap();
        assert_eq!(transition.command, Command::Abort);
        assert_eq!(transition.next, Idle);
    }

    #[test]
    fn countdown_chain_ends_in_processing() {
        let (phase, secs) = Calibrating(CalibrationStage::HoldStill)
            .on_countdown_finished()
            .unwrap();
        assert_eq!(phase, Calibrating(CalibrationStage::Blink));
        assert_eq!(secs, Some(10));

        let (phase, secs) = phase.on_countdown_finished().unwrap();
        assert_eq!(phase, Calibrating(CalibrationStage::Processing));
        assert_eq!(secs, None);

        // Processing waits for the device; nothing advances it by time.
        assert_eq!(phase.on_countdown_finished(), None);
    }

    #[test]
    fn status_lines_only_act_in_expected_phases() {
        let processing = Calibrating(CalibrationStage::Processing);
        assert_eq!(processing.on_failure_line(), Some(Idle));
        assert_eq!(processing.on_success_line(), Some(ReadyToBlink));

        assert_eq!(Running.on_success_line(), Some(Done));
        assert_eq!(Idle.on_failure_line(), None);
        assert_eq!(Baseline.on_success_line(), None);
    }

    #[test]
    fn countdown_allowed_only_in_timed_phases() {
        assert!(Calibrating(CalibrationStage::HoldStill).allows_countdown());
        assert!(Baseline.allows_countdown());
        assert!(!Running.allows_countdown());
        assert!(!Idle.allows_countdown());
        assert!(!ReadyToStart.allows_countdown());
    }
}
