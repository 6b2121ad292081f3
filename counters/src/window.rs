//! Fixed-window bucketing.
//!
//! Windows are fixed, not sliding: a burst straddling a boundary can reach up to twice the
//! nominal limit. Counters stay O(1) per check in exchange.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Deserialize;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// Keys outlive their window by this much so a late reader still sees the final value.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    /// UTC calendar day.
    Day,
    Custom(Duration),
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
            Window::Custom(_) => "custom",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            Window::Minute => MINUTE,
            Window::Day => DAY,
            Window::Custom(length) => *length,
        }
    }

    /// Identifier of the window that contains `now`.
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            Window::Day => now.format("%Y%m%d").to_string(),
            _ => self.bucket_index(now).to_string(),
        }
    }

    /// Start of the window following the one that contains `now`.
    pub fn reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Day => now
                .date_naive()
                .succ_opt()
                .map(|day| day.and_time(NaiveTime::MIN).and_utc())
                .unwrap_or(now + ChronoDuration::days(1)),
            _ => {
                let length_ms = self.length_ms();
                DateTime::from_timestamp_millis((self.bucket_index(now) + 1) * length_ms)
                    .unwrap_or(now + ChronoDuration::milliseconds(length_ms))
            }
        }
    }

    /// Whole seconds until the window rolls over, rounded up and never 0.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let remaining_ms = (self.reset_at(now) - now).num_milliseconds().max(0) as u64;
        remaining_ms.div_ceil(1000).max(1)
    }

    /// Expiry for a counter key of this window.
    pub fn ttl(&self) -> Duration {
        self.length() + EXPIRY_SLACK
    }

    fn length_ms(&self) -> i64 {
        (self.length().as_millis() as i64).max(1)
    }

    fn bucket_index(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().div_euclid(self.length_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, h, m, s).unwrap()
    }

    #[test]
    fn test_minute_buckets_are_floor_of_epoch_minutes() {
        let now = at(10, 15, 42);
        assert_eq!(
            Window::Minute.bucket(now),
            (now.timestamp() / 60).to_string()
        );
        assert_eq!(Window::Minute.bucket(now), Window::Minute.bucket(at(10, 15, 0)));
        assert_ne!(Window::Minute.bucket(now), Window::Minute.bucket(at(10, 16, 0)));
        assert_eq!(Window::Minute.reset_at(now), at(10, 16, 0));
        assert_eq!(Window::Minute.seconds_until_reset(now), 18);
    }

    #[test]
    fn test_day_buckets_follow_the_calendar() {
        let now = at(23, 59, 30);
        assert_eq!(Window::Day.bucket(now), "20240229");
        assert_eq!(
            Window::Day.reset_at(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(Window::Day.seconds_until_reset(now), 30);
    }

    #[test]
    fn test_custom_windows_use_their_own_length() {
        let fifteen = Window::Custom(Duration::from_secs(15 * 60));
        assert_eq!(fifteen.bucket(at(10, 0, 0)), fifteen.bucket(at(10, 14, 59)));
        assert_ne!(fifteen.bucket(at(10, 14, 59)), fifteen.bucket(at(10, 15, 0)));
        assert_eq!(fifteen.reset_at(at(10, 7, 0)), at(10, 15, 0));
        assert_eq!(fifteen.ttl(), Duration::from_secs(16 * 60));
    }

    #[test]
    fn test_reset_is_never_zero_seconds_away() {
        assert_eq!(Window::Minute.seconds_until_reset(at(10, 0, 0)), 60);
    }
}
