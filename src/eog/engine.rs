//! Async controller for the wearable protocol.
//!
//! Owns the attached device id, the phase machine state, the single
//! cancellable countdown task, and the notify-line consumer. Sleepy-minute
//! classifications are published onto the fatigue event bus.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, FatigueEvent};
use crate::link::transport::{uuids, BleTransport, LinkError, WriteMode};

use super::codec::{self, BlinkFlag, Command, InboundLine, MinuteSample};
use super::phase::{CalibrationStage, ProtocolPhase};

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

const STATUS_HOLD_STILL: &str = "Hold still";
const STATUS_BLINK: &str = "Blink normally";
const STATUS_PROCESSING: &str = "Processing calibration";
const STATUS_BASELINE: &str = "Recording baseline, keep your eyes relaxed";
const STATUS_CALIBRATION_FAILED: &str = "Calibration failed, try again";
const STATUS_CALIBRATION_DONE: &str = "Calibration complete";
const STATUS_SESSION_DONE: &str = "Session complete";
const STATUS_WRITE_FAILED: &str = "Command failed, check the device connection";

#[derive(Debug, Clone, Copy)]
pub struct EogConfig {
    /// One countdown second elapses per tick. Tests shrink this.
    pub countdown_tick: Duration,
}

impl Default for EogConfig {
    fn default() -> Self {
        Self {
            countdown_tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EogSnapshot {
    pub attached_device: Option<String>,
    pub phase: ProtocolPhase,
    pub countdown_secs: Option<u32>,
    pub status: Option<String>,
    pub minute_history: Vec<MinuteSample>,
    pub last_flag: Option<BlinkFlag>,
}

struct EogState {
    device_id: Option<String>,
    phase: ProtocolPhase,
    countdown: Option<u32>,
    status: Option<String>,
    history: Vec<MinuteSample>,
    last_flag: Option<BlinkFlag>,
}

impl EogState {
    fn new() -> Self {
        Self {
            device_id: None,
            phase: ProtocolPhase::Idle,
            countdown: None,
            status: None,
            history: Vec::new(),
            last_flag: None,
        }
    }

    fn reset(&mut self) {
        self.phase = ProtocolPhase::Idle;
        self.countdown = None;
        self.status = None;
        self.history.clear();
        self.last_flag = None;
    }
}

pub struct EogEngine<T: BleTransport> {
    transport: Arc<T>,
    bus: EventBus,
    config: EogConfig,
    state: Arc<Mutex<EogState>>,
    countdown: Arc<Mutex<Option<CancellationToken>>>,
    line_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: BleTransport> Clone for EogEngine<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            bus: self.bus.clone(),
            config: self.config,
            state: Arc::clone(&self.state),
            countdown: Arc::clone(&self.countdown),
            line_task: Arc::clone(&self.line_task),
        }
    }
}

impl<T: BleTransport> EogEngine<T> {
    pub fn new(transport: Arc<T>, bus: EventBus, config: EogConfig) -> Self {
        Self {
            transport,
            bus,
            config,
            state: Arc::new(Mutex::new(EogState::new())),
            countdown: Arc::new(Mutex::new(None)),
            line_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Attaches the engine to a device and starts consuming its notify
    /// lines. Attaching a second device implicitly detaches the first;
    /// re-attaching the already-attached id is a no-op.
    pub async fn attach(&self, device_id: &str, mut lines: mpsc::Receiver<Vec<u8>>) {
        {
            let st = self.state.lock().await;
            if st.device_id.as_deref() == Some(device_id) {
                log_info!("already attached to {device_id}");
                return;
            }
        }

        self.detach().await;
        self.state.lock().await.device_id = Some(device_id.to_string());

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = lines.recv().await {
                engine.on_notify(&payload).await;
            }
        });
        *self.line_task.lock().await = Some(handle);
        log_info!("attached to {device_id}");
    }

    /// Clears all timers, releases the line subscription and restores Idle
    /// with an empty history.
    pub async fn detach(&self) {
        if let Some(handle) = self.line_task.lock().await.take() {
            handle.abort();
        }
        self.cancel_countdown().await;
        let mut st = self.state.lock().await;
        st.device_id = None;
        st.reset();
    }

    pub async fn snapshot(&self) -> EogSnapshot {
        let st = self.state.lock().await;
        EogSnapshot {
            attached_device: st.device_id.clone(),
            phase: st.phase,
            countdown_secs: st.countdown,
            status: st.status.clone(),
            minute_history: st.history.clone(),
            last_flag: st.last_flag,
        }
    }

    /// The single main-button action; what it does depends on the phase.
    /// A failed write of the triggering command rolls the phase back,
    /// except for aborts, whose local reset always stands.
    pub async fn main_button(&self) -> Result<()> {
        let (device_id, prior_phase, prior_countdown, transition) = {
            let st = self.state.lock().await;
            let device_id = st
                .device_id
                .clone()
                .ok_or_else(|| anyhow!("no device attached"))?;
            let Some(transition) = st.phase.on_main_button() else {
                return Ok(());
            };
            (device_id, st.phase, st.countdown, transition)
        };

        self.cancel_countdown().await;
        {
            let mut st = self.state.lock().await;
            st.phase = transition.next;
            st.countdown = transition.countdown_secs;
            st.status = status_for(transition.next);
        }
        if let Some(secs) = transition.countdown_secs {
            self.start_countdown(secs).await;
        }
        log_info!(
            "main button: {prior_phase:?} -> {:?} ({:?})",
            transition.next,
            transition.command
        );

        match self.write_command(&device_id, transition.command).await {
            Ok(()) => Ok(()),
            Err(err) if transition.is_abort => {
                log_warn!("abort write failed, local state reset stands: {err}");
                Ok(())
            }
            Err(err) => {
                self.cancel_countdown().await;
                let mut st = self.state.lock().await;
                st.phase = prior_phase;
                st.countdown = prior_countdown;
                st.status = Some(STATUS_WRITE_FAILED.to_string());
                Err(err.into())
            }
        }
    }

    /// Plain-text summary of the minute history, for external delivery.
    pub async fn session_report(&self) -> String {
        let st = self.state.lock().await;
        let mut report = String::from("Blink session report\n");
        for sample in &st.history {
            let _ = writeln!(
                report,
                "minute {}: {} normal, {} slow ({})",
                sample.minute,
                sample.normal_blinks,
                sample.slow_blinks,
                match sample.flag {
                    BlinkFlag::Sleepy => "sleepy",
                    BlinkFlag::NotSleepy => "not sleepy",
                }
            );
        }
        let verdict = match st.last_flag {
            Some(BlinkFlag::Sleepy) => "sleepy",
            Some(BlinkFlag::NotSleepy) => "not sleepy",
            None => "no data",
        };
        let _ = writeln!(report, "final classification: {verdict}");
        report
    }

    /// Fire-and-forget first, one acknowledged retry on failure.
    async fn write_command(&self, device_id: &str, command: Command) -> Result<(), LinkError> {
        let payload = codec::encode_command(command);
        match self
            .transport
            .write(
                device_id,
                uuids::EOG_WRITE_CHARACTERISTIC,
                &payload,
                WriteMode::WithoutResponse,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(first) => {
                log_warn!("unacked write of {command:?} failed ({first}), retrying acknowledged");
                self.transport
                    .write(
                        device_id,
                        uuids::EOG_WRITE_CHARACTERISTIC,
                        &payload,
                        WriteMode::WithResponse,
                    )
                    .await
            }
        }
    }

    async fn on_notify(&self, payload: &[u8]) {
        let Some(line) = codec::decode_line(payload) else {
            return;
        };
        match codec::parse_line(&line) {
            InboundLine::Minute(sample) => self.on_minute(sample).await,
            InboundLine::CalibrationFailed => {
                let mut st = self.state.lock().await;
                if let Some(next) = st.phase.on_failure_line() {
                    st.phase = next;
                    st.countdown = None;
                    st.status = Some(STATUS_CALIBRATION_FAILED.to_string());
                }
            }
            InboundLine::CalibrationSucceeded => {
                let mut st = self.state.lock().await;
                if let Some(next) = st.phase.on_success_line() {
                    st.phase = next;
                    st.countdown = None;
                    st.status = Some(match next {
                        ProtocolPhase::Done => STATUS_SESSION_DONE.to_string(),
                        _ => STATUS_CALIBRATION_DONE.to_string(),
                    });
                }
            }
            InboundLine::Ignored => {}
        }
    }

    async fn on_minute(&self, sample: MinuteSample) {
        let minute = sample.minute;
        let sleepy = sample.flag == BlinkFlag::Sleepy;
        {
            let mut st = self.state.lock().await;
            st.last_flag = Some(sample.flag);
            st.history.push(sample);
        }
        if sleepy {
            log_warn!("wearable classified minute {minute} as sleepy");
            self.bus.publish(FatigueEvent::SleepyMinute { minute });
        }
    }

    /// Runs the countdown for the current phase, chaining into follow-up
    /// countdowns (hold-still into blink) within the same task so rapid
    /// phase changes can cancel the whole chain through one token.
    async fn start_countdown(&self, secs: u32) {
        self.cancel_countdown().await;
        let token = CancellationToken::new();
        *self.countdown.lock().await = Some(token.clone());

        let engine = self.clone();
        let tick = self.config.countdown_tick;
        tokio::spawn(async move {
            let mut remaining = secs;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                remaining = remaining.saturating_sub(1);
                engine.state.lock().await.countdown = Some(remaining);

                if remaining > 0 {
                    continue;
                }
                if token.is_cancelled() {
                    return;
                }
                let follow_up = {
                    let mut st = engine.state.lock().await;
                    match st.phase.on_countdown_finished() {
                        Some((next, next_secs)) => {
                            st.phase = next;
                            st.countdown = next_secs;
                            st.status = status_for(next);
                            next_secs
                        }
                        None => {
                            st.countdown = None;
                            None
                        }
                    }
                };
                match follow_up {
                    Some(next_secs) => remaining = next_secs,
                    None => return,
                }
            }
        });
    }

    async fn cancel_countdown(&self) {
        if let Some(token) = self.countdown.lock().await.take() {
            token.cancel();
        }
    }
}

fn status_for(phase: ProtocolPhase) -> Option<String> {
    match phase {
        ProtocolPhase::Calibrating(CalibrationStage::HoldStill) => {
            Some(STATUS_HOLD_STILL.to_string())
        }
        ProtocolPhase::Calibrating(CalibrationStage::Blink) => Some(STATUS_BLINK.to_string()),
        ProtocolPhase::Calibrating(CalibrationStage::Processing) => {
            Some(STATUS_PROCESSING.to_string())
        }
        ProtocolPhase::Baseline => Some(STATUS_BASELINE.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockTransport;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use tokio::sync::broadcast::error::TryRecvError;

    fn fast_config() -> EogConfig {
        EogConfig {
            countdown_tick: Duration::from_millis(2),
        }
    }

    fn engine() -> (Arc<MockTransport>, EventBus, EogEngine<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let bus = EventBus::default();
        let engine = EogEngine::new(Arc::clone(&transport), bus.clone(), fast_config());
        (transport, bus, engine)
    }

    async fn attach(engine: &EogEngine<MockTransport>) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        engine.attach("band-1", rx).await;
        tx
    }

    fn wire_line(line: &str) -> Vec<u8> {
        BASE64.encode(line).into_bytes()
    }

    #[tokio::test]
    async fn calibration_walks_both_countdowns_into_processing() {
        let (_transport, _bus, engine) = engine();
        attach(&engine).await;

        engine.main_button().await.unwrap();
        let snap = engine.snapshot().await;
        assert_eq!(
            snap.phase,
            ProtocolPhase::Calibrating(CalibrationStage::HoldStill)
        );
        assert_eq!(snap.countdown_secs, Some(10));

        // Both 10-tick sub-phases elapse with no inbound message.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = engine.snapshot().await;
        assert_eq!(
            snap.phase,
            ProtocolPhase::Calibrating(CalibrationStage::Processing)
        );
        assert_eq!(snap.countdown_secs, None);
        assert_eq!(snap.status.as_deref(), Some(STATUS_PROCESSING));
    }

    #[tokio::test]
    async fn success_line_completes_calibration_and_baseline_runs() {
        let (transport, _bus, engine) = engine();
        let lines = attach(&engine).await;

        engine.main_button().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        lines
            .send(wire_line("Calibra??o conclu?da com sucesso"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = engine.snapshot().await;
        assert_eq!(snap.phase, ProtocolPhase::ReadyToBlink);
        assert_eq!(snap.status.as_deref(), Some(STATUS_CALIBRATION_DONE));

        // Baseline: 30 ticks, then ready to start with status cleared.
        engine.main_button().await.unwrap();
        assert_eq!(engine.snapshot().await.countdown_secs, Some(30));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snap = engine.snapshot().await;
        assert_eq!(snap.phase, ProtocolPhase::ReadyToStart);
        assert_eq!(snap.countdown_secs, None);
        assert_eq!(snap.status, None);

        engine.main_button().await.unwrap();
        assert_eq!(engine.snapshot().await.phase, ProtocolPhase::Running);

        let writes = transport.writes.lock().unwrap();
        let payloads: Vec<Vec<u8>> = writes
            .iter()
            .map(|(_, payload, _)| BASE64.decode(payload).unwrap())
            .collect();
        assert_eq!(payloads, vec![b"C\n".to_vec(), b"P\n".to_vec(), b"S\n".to_vec()]);
    }

    #[tokio::test]
    async fn failure_line_returns_to_idle() {
        let (_transport, _bus, engine) = engine();
        let lines = attach(&engine).await;

        engine.main_button().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        lines
            .send(wire_line("Calibra??o mal efetuada, tente novamente"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = engine.snapshot().await;
        assert_eq!(snap.phase, ProtocolPhase::Idle);
        assert_eq!(snap.status.as_deref(), Some(STATUS_CALIBRATION_FAILED));
    }

    #[tokio::test]
    async fn sleepy_minute_appends_history_and_publishes_once() {
        let (_transport, bus, engine) = engine();
        let lines = attach(&engine).await;
        let mut events = bus.subscribe();

        lines.send(wire_line(r#"["M3",12,4,"S-"]"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = engine.snapshot().await;
        assert_eq!(snap.minute_history.len(), 1);
        assert_eq!(snap.minute_history[0].minute, 3);
        assert_eq!(snap.minute_history[0].normal_blinks, 12);
        assert_eq!(snap.minute_history[0].slow_blinks, 4);
        assert_eq!(snap.last_flag, Some(BlinkFlag::Sleepy));

        match events.try_recv() {
            Ok(FatigueEvent::SleepyMinute { minute }) => assert_eq!(minute, 3),
            other => panic!("expected sleepy-minute event, got {other:?}"),
        }
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn not_sleepy_and_malformed_lines_do_not_trigger() {
        let (_transport, bus, engine) = engine();
        let lines = attach(&engine).await;
        let mut events = bus.subscribe();

        lines.send(wire_line(r#"["M1",15,1,"NS-"]"#)).await.unwrap();
        lines.send(wire_line(r#"["M2",15]"#)).await.unwrap();
        lines.send(b"!!not-base64!!".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = engine.snapshot().await;
        assert_eq!(snap.minute_history.len(), 1);
        assert_eq!(snap.last_flag, Some(BlinkFlag::NotSleepy));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn write_failure_rolls_the_phase_back() {
        let (transport, _bus, engine) = engine();
        attach(&engine).await;
        *transport.fail_all_writes.lock().unwrap() = true;

        assert!(engine.main_button().await.is_err());
        let snap = engine.snapshot().await;
        assert_eq!(snap.phase, ProtocolPhase::Idle);
        assert_eq!(snap.countdown_secs, None);
        assert_eq!(snap.status.as_deref(), Some(STATUS_WRITE_FAILED));
    }

    #[tokio::test]
    async fn abort_resets_locally_even_when_write_fails() {
        let (transport, _bus, engine) = engine();
        attach(&engine).await;

        engine.main_button().await.unwrap();
        *transport.fail_all_writes.lock().unwrap() = true;

        engine.main_button().await.unwrap();
        let snap = engine.snapshot().await;
        assert_eq!(snap.phase, ProtocolPhase::Idle);
        assert_eq!(snap.countdown_secs, None);
    }

    #[tokio::test]
    async fn unacked_write_failure_retries_acknowledged() {
        let (transport, _bus, engine) = engine();
        attach(&engine).await;
        *transport.fail_writes_without_response.lock().unwrap() = true;

        engine.main_button().await.unwrap();

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].2, WriteMode::WithResponse);
        assert_eq!(BASE64.decode(&writes[0].1).unwrap(), b"C\n");
    }

    #[tokio::test]
    async fn reattach_same_device_is_noop_and_detach_resets() {
        let (_transport, _bus, engine) = engine();
        let lines = attach(&engine).await;

        lines.send(wire_line(r#"["M1",10,2,"NS-"]"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same id: history and line consumer survive.
        let (_tx2, rx2) = mpsc::channel(16);
        engine.attach("band-1", rx2).await;
        assert_eq!(engine.snapshot().await.minute_history.len(), 1);
        lines.send(wire_line(r#"["M2",11,1,"NS-"]"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.snapshot().await.minute_history.len(), 2);

        engine.detach().await;
        let snap = engine.snapshot().await;
        assert_eq!(snap.attached_device, None);
        assert_eq!(snap.phase, ProtocolPhase::Idle);
        assert!(snap.minute_history.is_empty());
    }

    #[tokio::test]
    async fn session_report_summarizes_history() {
        let (_transport, _bus, engine) = engine();
        let lines = attach(&engine).await;

        lines.send(wire_line(r#"["M1",14,1,"NS-"]"#)).await.unwrap();
        lines.send(wire_line(r#"["M2",9,6,"S-"]"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = engine.session_report().await;
        assert!(report.contains("minute 1: 14 normal, 1 slow (not sleepy)"));
        assert!(report.contains("minute 2: 9 normal, 6 slow (sleepy)"));
        assert!(report.contains("final classification: sleepy"));
    }
}
