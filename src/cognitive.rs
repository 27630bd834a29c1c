//! Periodic voice attention checks: a spoken single-digit addition the
//! driver must answer. No response inside the timeout publishes a fatigue
//! trigger. Speech synthesis and recognition live behind [`VoicePrompt`]
//! and the reply parser; the scheduler only owns timing and arithmetic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, FatigueEvent};
use crate::providers::VoicePrompt;

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy)]
pub struct CognitiveConfig {
    /// Time between challenges while monitoring.
    pub challenge_interval: Duration,
    /// Cadence of the scheduling loop.
    pub poll_interval: Duration,
    /// How long the driver has to answer.
    pub response_timeout: Duration,
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            challenge_interval: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub lhs: u32,
    pub rhs: u32,
}

impl Challenge {
    pub fn answer(&self) -> u32 {
        self.lhs + self.rhs
    }
}

struct PendingChallenge {
    id: u64,
    challenge: Challenge,
}

struct CognitiveState {
    active: bool,
    last_check: Instant,
    pending: Option<PendingChallenge>,
}

pub struct CognitiveScheduler<V: VoicePrompt + 'static> {
    voice: Arc<V>,
    bus: EventBus,
    config: CognitiveConfig,
    state: Arc<Mutex<CognitiveState>>,
    next_id: Arc<AtomicU64>,
    worker: Arc<Mutex<Option<CancellationToken>>>,
}

impl<V: VoicePrompt + 'static> Clone for CognitiveScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            voice: Arc::clone(&self.voice),
            bus: self.bus.clone(),
            config: self.config,
            state: Arc::clone(&self.state),
            next_id: Arc::clone(&self.next_id),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<V: VoicePrompt + 'static> CognitiveScheduler<V> {
    pub fn new(voice: Arc<V>, bus: EventBus, config: CognitiveConfig) -> Self {
        Self {
            voice,
            bus,
            config,
            state: Arc::new(Mutex::new(CognitiveState {
                active: false,
                last_check: Instant::now(),
                pending: None,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start_monitoring(&self) {
        {
            let mut st = self.state.lock().await;
            if st.active {
                return;
            }
            st.active = true;
            st.last_check = Instant::now();
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.worker.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let due = {
                            let st = scheduler.state.lock().await;
                            st.active
                                && st.pending.is_none()
                                && st.last_check.elapsed() > scheduler.config.challenge_interval
                        };
                        if due {
                            scheduler.trigger_check().await;
                        }
                    }
                }
            }
        });
        log_info!("cognitive checks started");
    }

    pub async fn stop_monitoring(&self) {
        if let Some(token) = self.worker.lock().await.take() {
            token.cancel();
        }
        let mut st = self.state.lock().await;
        st.active = false;
        st.pending = None;
    }

    pub async fn pending_challenge(&self) -> Option<Challenge> {
        self.state.lock().await.pending.as_ref().map(|p| p.challenge)
    }

    /// Issues a challenge now and arms its one-shot timeout. The timeout
    /// checks that this exact challenge is still unanswered when it fires.
    pub async fn trigger_check(&self) {
        let challenge = {
            let mut rng = rand::thread_rng();
            Challenge {
                lhs: rng.gen_range(1..=9),
                rhs: rng.gen_range(1..=9),
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut st = self.state.lock().await;
            st.pending = Some(PendingChallenge { id, challenge });
            st.last_check = Instant::now();
        }
        self.voice.speak(&format!(
            "Attention check. What is {} plus {}?",
            challenge.lhs, challenge.rhs
        ));

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(scheduler.config.response_timeout).await;
            let timed_out = {
                let mut st = scheduler.state.lock().await;
                match &st.pending {
                    Some(pending) if pending.id == id => {
                        st.pending = None;
                        st.last_check = Instant::now();
                        true
                    }
                    _ => false,
                }
            };
            if timed_out {
                log_warn!("attention check went unanswered");
                scheduler.voice.speak("No response. Attention alert!");
                scheduler.bus.publish(FatigueEvent::CognitiveTimeout);
            }
        });
    }

    /// Feeds a transcribed reply. Returns true when it answers the pending
    /// challenge; a wrong reply leaves the challenge armed.
    pub async fn submit_answer(&self, text: &str) -> bool {
        let Some(value) = parse_reply(text) else {
            return false;
        };
        let mut st = self.state.lock().await;
        let Some(pending) = &st.pending else {
            return false;
        };
        if value != pending.challenge.answer() {
            log_info!("wrong answer {value}, challenge stays armed");
            return false;
        }
        st.pending = None;
        st.last_check = Instant::now();
        drop(st);
        self.voice.speak("Correct. Safe travels.");
        true
    }
}

/// Extracts a number from a transcribed reply: digits anywhere in the text,
/// falling back to spelled-out words for the reachable sums.
fn parse_reply(text: &str) -> Option<u32> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        return digits.parse().ok();
    }

    match text.trim().to_lowercase().as_str() {
        "two" => Some(2),
        "three" => Some(3),
        "four" => Some(4),
        "five" => Some(5),
        "six" => Some(6),
        "seven" => Some(7),
        "eight" => Some(8),
        "nine" => Some(9),
        "ten" => Some(10),
        "eleven" => Some(11),
        "twelve" => Some(12),
        "thirteen" => Some(13),
        "fourteen" => Some(14),
        "fifteen" => Some(15),
        "sixteen" => Some(16),
        "seventeen" => Some(17),
        "eighteen" => Some(18),
        _ => None,
    }
}
