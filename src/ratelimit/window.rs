//! Fixed counting windows and the clock they are cut from.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifetime of a cached dynamic quota, independent of the counting window.
pub const QUOTA_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Window strategy for a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStrategy {
    /// Counters reset at every UTC hour boundary
    Hourly,
    /// Counters reset at every UTC day boundary
    #[default]
    Daily,
}

impl WindowStrategy {
    /// Get the duration of this window, used as the counter TTL.
    pub fn duration(&self) -> Duration {
        match self {
            WindowStrategy::Hourly => Duration::from_secs(3600),
            WindowStrategy::Daily => Duration::from_secs(86400),
        }
    }

    /// Bucket label for the window containing `now`.
    ///
    /// Two instants inside the same window always produce the same label.
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            WindowStrategy::Hourly => now.format("%Y%m%d%H").to_string(),
            WindowStrategy::Daily => now.format("%Y%m%d").to_string(),
        }
    }
}

/// Source of wall-clock time for window bucketing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_duration() {
        assert_eq!(WindowStrategy::Hourly.duration(), Duration::from_secs(3600));
        assert_eq!(WindowStrategy::Daily.duration(), Duration::from_secs(86400));
        assert_eq!(WindowStrategy::default(), WindowStrategy::Daily);
    }

    #[test]
    fn test_bucket_labels() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 15, 0).unwrap();
        assert_eq!(WindowStrategy::Hourly.bucket(at), "2024030709");
        assert_eq!(WindowStrategy::Daily.bucket(at), "20240307");
    }

    #[test]
    fn test_same_window_same_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 3, 7, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 7, 9, 59, 59).unwrap();
        assert_eq!(
            WindowStrategy::Hourly.bucket(start),
            WindowStrategy::Hourly.bucket(end)
        );

        let next = Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap();
        assert_ne!(
            WindowStrategy::Hourly.bucket(end),
            WindowStrategy::Hourly.bucket(next)
        );
        assert_eq!(
            WindowStrategy::Daily.bucket(end),
            WindowStrategy::Daily.bucket(next)
        );
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 23, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(45));
        assert_eq!(WindowStrategy::Daily.bucket(clock.now()), "20240102");
    }

    #[test]
    fn test_parse_strategy() {
        let hourly: WindowStrategy = serde_yaml::from_str("hourly").unwrap();
        assert_eq!(hourly, WindowStrategy::Hourly);
        assert!(serde_yaml::from_str::<WindowStrategy>("weekly").is_err());
    }
}
