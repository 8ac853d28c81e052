//! Scheduler settings.

use std::time::Duration;

pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_INTERVAL: Duration = Duration::from_secs(120 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Controls when the scheduler runs cycles on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Enables the periodic timer and the dirty-debounce trigger
    pub auto_sync: bool,
    interval: Duration,
    /// Quiet period after the last local mutation before a debounced cycle
    pub debounce: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: true,
            interval: DEFAULT_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl SyncSettings {
    pub fn new(auto_sync: bool, interval: Duration) -> Self {
        Self {
            auto_sync,
            interval: clamp_interval(interval),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = clamp_interval(interval);
    }
}

pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}
