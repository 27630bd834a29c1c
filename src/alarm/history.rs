//! Sliding window over recent alarm timestamps, driving the advisory
//! rest-stop suggestion.

pub const REST_STOP_WINDOW_MS: u64 = 15 * 60 * 1000;
pub const REST_STOP_MIN_ALARMS: usize = 2;

#[derive(Debug, Default)]
pub struct AlarmHistory {
    timestamps_ms: Vec<u64>,
    suggest_rest_stop: bool,
}

impl AlarmHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a trigger, prunes entries older than the window, and raises
    /// the rest-stop flag once enough alarms cluster inside it. Returns the
    /// flag state after recording.
    pub fn record(&mut self, now_ms: u64) -> bool {
        // Prune by age, not by absolute cutoff: early in the clock's life a
        // saturated cutoff of 0 would drop a legitimate entry at t=0.
        self.timestamps_ms
            .retain(|&ts| now_ms.saturating_sub(ts) < REST_STOP_WINDOW_MS);
        self.timestamps_ms.push(now_ms);

        if self.timestamps_ms.len() >= REST_STOP_MIN_ALARMS {
            self.suggest_rest_stop = true;
        }
        self.suggest_rest_stop
    }

    /// Advisory only; stopping an alarm does not clear it.
    pub fn suggest_rest_stop(&self) -> bool {
        self.suggest_rest_stop
    }

    pub fn dismiss_rest_stop(&mut self) {
        self.suggest_rest_stop = false;
    }

    pub fn recent_count(&self) -> usize {
        self.timestamps_ms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u64 = 60 * 1000;

    #[test]
    fn two_alarms_within_window_suggest_rest() {
        let mut history = AlarmHistory::new();
        assert!(!history.record(0));
        assert!(!history.suggest_rest_stop());

        // 10 minutes later, same window.
        assert!(history.record(10 * MINUTE_MS));
        assert!(history.suggest_rest_stop());
    }

    #[test]
    fn alarms_outside_window_do_not_accumulate() {
        let mut history = AlarmHistory::new();
        assert!(!history.record(0));
        assert!(!history.record(20 * MINUTE_MS));
        assert_eq!(history.recent_count(), 1);
    }

    #[test]
    fn entry_at_time_zero_survives_pruning() {
        let mut history = AlarmHistory::new();
        assert!(!history.record(0));
        // Just inside the window: the t=0 entry still counts.
        assert!(history.record(REST_STOP_WINDOW_MS - 1));

        // Exactly one window old is out.
        let mut history = AlarmHistory::new();
        assert!(!history.record(0));
        assert!(!history.record(REST_STOP_WINDOW_MS));
        assert_eq!(history.recent_count(), 1);
    }

    #[test]
    fn dismiss_clears_only_the_flag() {
        let mut history = AlarmHistory::new();
        history.record(0);
        history.record(MINUTE_MS);
        assert!(history.suggest_rest_stop());

        history.dismiss_rest_stop();
        assert!(!history.suggest_rest_stop());
        assert_eq!(history.recent_count(), 2);

        // Another trigger inside the window raises it again.
        assert!(history.record(2 * MINUTE_MS));
    }
}
