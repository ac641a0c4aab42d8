use std::time::Duration;

/// Polling cadence and backoff
///
/// Intervals are expected (not required) to satisfy
/// `hidden_interval >= idle_interval >= active_interval`.
#[derive(Clone, Debug, PartialEq)]
pub struct PollingConfig {
    /// Interval while the user is active and the page is visible
    pub active_interval: Duration,
    /// Interval once no activity was seen for `idle_threshold`
    pub idle_interval: Duration,
    /// Interval while the page is hidden; also caps failure backoff
    pub hidden_interval: Duration,
    pub idle_threshold: Duration,
    /// Cap on the failure count used to scale backoff
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    /// Fetches closer together than this are skipped
    pub min_fetch_gap: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(120),
            hidden_interval: Duration::from_secs(300),
            idle_threshold: Duration::from_secs(120),
            max_retries: 5,
            backoff_multiplier: 2.0,
            min_fetch_gap: Duration::from_secs(10),
        }
    }
}

impl PollingConfig {
    /// Interval for the given visibility and time since the last activity
    pub fn base_interval(&self, hidden: bool, idle_for: Duration) -> Duration {
        if hidden {
            self.hidden_interval
        } else if idle_for > self.idle_threshold {
            self.idle_interval
        } else {
            self.active_interval
        }
    }

    /// `interval * multiplier^failures`, never above `hidden_interval`
    pub fn backoff_interval(&self, interval: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return interval.min(self.hidden_interval);
        }
        let scaled = interval.as_millis() as f64 * self.backoff_multiplier.powi(failures as i32);
        let capped = scaled.min(self.hidden_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
