//! Billing periods.
//!
//! A team's period is a calendar month anchored on the day and time of its billing-cycle
//! anchor, not on the first of the month. Anchors on the 29th–31st are clamped to the last
//! day of shorter months. The billing collaborator resets the anchor on upgrade and keeps
//! it on downgrade; this module only does the date arithmetic.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// The period anchored on `anchor` that contains `now`.
    pub fn containing(anchor: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let (mut year, mut month) = (now.year(), now.month());
        let mut start = anchored_start(anchor, year, month);
        if start > now {
            (year, month) = previous_month(year, month);
            start = anchored_start(anchor, year, month);
        }
        let (next_year, next_month) = next_month(year, month);
        BillingPeriod {
            start,
            end: anchored_start(anchor, next_year, next_month),
        }
    }

    /// Stable identifier of the period, used in usage rows and cache keys.
    pub fn key(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    /// Whole seconds until the period ends, rounded up and never 0.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.end - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000).max(1)
    }
}

fn anchored_start(anchor: DateTime<Utc>, year: i32, month: u32) -> DateTime<Utc> {
    let day = anchor.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_default()
        .and_time(anchor.time())
        .and_utc()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 31,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_period_follows_the_anchor_day() {
        let anchor = utc(2023, 11, 15, 8);

        let period = BillingPeriod::containing(anchor, utc(2024, 3, 20, 0));
        assert_eq!(period.start, utc(2024, 3, 15, 8));
        assert_eq!(period.end, utc(2024, 4, 15, 8));
        assert_eq!(period.key(), "2024-03-15");

        // Before the anchor time on the anchor day still belongs to the previous period.
        let period = BillingPeriod::containing(anchor, utc(2024, 3, 15, 7));
        assert_eq!(period.start, utc(2024, 2, 15, 8));
    }

    #[test]
    fn test_late_anchors_clamp_to_short_months() {
        let anchor = utc(2024, 1, 31, 0);

        let period = BillingPeriod::containing(anchor, utc(2024, 2, 29, 12));
        assert_eq!(period.start, utc(2024, 2, 29, 0));
        assert_eq!(period.end, utc(2024, 3, 31, 0));

        let period = BillingPeriod::containing(anchor, utc(2023, 2, 10, 0));
        assert_eq!(period.start, utc(2023, 1, 31, 0));
        assert_eq!(period.end, utc(2023, 2, 28, 0));
    }

    #[test]
    fn test_year_boundaries() {
        let anchor = utc(2022, 6, 10, 0);
        let period = BillingPeriod::containing(anchor, utc(2024, 1, 5, 0));
        assert_eq!(period.start, utc(2023, 12, 10, 0));
        assert_eq!(period.end, utc(2024, 1, 10, 0));
        assert_eq!(period.seconds_remaining(utc(2024, 1, 9, 23)), 3600);
    }
}
