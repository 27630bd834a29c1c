pub mod siren;

use siren::Siren;

use anyhow::{anyhow, Result};
use rodio::{OutputStream, Sink};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Sender},
    Arc, Mutex,
};
use std::thread;

use crate::providers::Actuation;

const ENABLE_LOGS: bool = true;
use crate::log_warn;

enum AudioCommand {
    Start,
    Stop,
    SetVolume(f32),
}

/// Handle to the dedicated audio thread holding the non-Send rodio objects.
/// The thread is spawned lazily on first use.
pub struct AlarmAudioHandle {
    tx: Arc<Mutex<Option<Sender<AudioCommand>>>>,
    is_playing: Arc<AtomicBool>,
}

impl AlarmAudioHandle {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
            is_playing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        if let Some(tx) = self.tx.lock().map_err(|e| anyhow!(e.to_string()))?.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();
        let is_playing = Arc::clone(&self.is_playing);

        thread::Builder::new()
            .name("alarm-audio".to_string())
            .spawn(move || {
                let mut _stream: Option<OutputStream> = None;
                let mut sink: Option<Sink> = None;

                fn ensure_sink(
                    stream: &mut Option<OutputStream>,
                    sink: &mut Option<Sink>,
                ) -> Result<(), String> {
                    if sink.is_none() {
                        let (s, handle) = OutputStream::try_default()
                            .map_err(|e| format!("Failed to create audio output stream: {}", e))?;
                        let new_sink = Sink::try_new(&handle)
                            .map_err(|e| format!("Failed to create audio sink: {}", e))?;
                        *stream = Some(s);
                        *sink = Some(new_sink);
                    }
                    Ok(())
                }

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        AudioCommand::Start => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                            _stream = None;
                            if ensure_sink(&mut _stream, &mut sink).is_ok() {
                                if let Some(ref s) = sink {
                                    s.append(Siren::new());
                                    is_playing.store(true, Ordering::SeqCst);
                                }
                            }
                        }
                        AudioCommand::Stop => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                            _stream = None;
                            is_playing.store(false, Ordering::SeqCst);
                        }
                        AudioCommand::SetVolume(v) => {
                            if let Some(ref s) = sink {
                                s.set_volume(v.clamp(0.0, 1.0));
                            }
                        }
                    }
                }
            })
            .map_err(|e| anyhow!(e.to_string()))?;

        let tx_clone = tx.clone();
        *self.tx.lock().map_err(|e| anyhow!(e.to_string()))? = Some(tx);
        Ok(tx_clone)
    }

    pub fn start(&self) -> Result<()> {
        let tx = self.ensure_thread()?;
        tx.send(AudioCommand::Start)
            .map_err(|e| anyhow!(e.to_string()))
    }

    pub fn stop(&self) -> Result<()> {
        if let Ok(Some(tx)) = self.tx.lock().map(|g| g.clone()) {
            let _ = tx.send(AudioCommand::Stop);
        }
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let tx = self.ensure_thread()?;
        tx.send(AudioCommand::SetVolume(volume))
            .map_err(|e| anyhow!(e.to_string()))
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }
}

impl Default for AlarmAudioHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Desktop actuation surface: real siren audio, everything telephony- or
/// flashlight-shaped is a logged no-op.
pub struct DesktopActuation {
    audio: AlarmAudioHandle,
}

impl DesktopActuation {
    pub fn new() -> Self {
        Self {
            audio: AlarmAudioHandle::new(),
        }
    }
}

impl Default for DesktopActuation {
    fn default() -> Self {
        Self::new()
    }
}

impl Actuation for DesktopActuation {
    fn set_max_volume(&self) -> Result<()> {
        self.audio.set_volume(1.0)
    }

    fn play_alarm(&self, via_car_audio: bool) -> Result<()> {
        if via_car_audio {
            log_warn!("no hands-free routing on this platform, using default output");
        }
        self.audio.start()
    }

    fn stop_alarm(&self) -> Result<()> {
        self.audio.stop()
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
