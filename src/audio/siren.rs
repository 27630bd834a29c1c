use rodio::Source;
use std::f32::consts::PI;
use std::time::Duration;

const LOW_FREQ: f32 = 600.0;
const HIGH_FREQ: f32 = 1200.0;
/// Sweep cycles per second.
const SWEEP_RATE: f32 = 2.5;

/// Infinite two-tone siren sweeping between 600 and 1200 Hz.
/// Amplitude stays near full scale; this is an alarm, not ambience.
pub struct Siren {
    sample_rate: u32,
    num_sample: usize,
    phase: f32,
}

impl Siren {
    pub fn new() -> Self {
        Self {
            sample_rate: 44100,
            num_sample: 0,
            phase: 0.0,
        }
    }
}

impl Default for Siren {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Siren {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        self.num_sample = self.num_sample.wrapping_add(1);
        let t = self.num_sample as f32 / self.sample_rate as f32;

        // Phase accumulation keeps the sweep click-free.
        let sweep = (2.0 * PI * SWEEP_RATE * t).sin() * 0.5 + 0.5;
        let freq = LOW_FREQ + (HIGH_FREQ - LOW_FREQ) * sweep;
        self.phase += 2.0 * PI * freq / self.sample_rate as f32;
        if self.phase > 2.0 * PI {
            self.phase -= 2.0 * PI;
        }

        Some(self.phase.sin() * 0.9)
    }
}

impl Source for Siren {
    fn current_frame_len(&self) -> Option<usize> {
        None // Infinite stream
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite
    }
}
