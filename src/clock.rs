//! Wall-clock source for timestamps and calendar dates.
//!
//! Persisted records use local time without offset, formatted as
//! `YYYY-MM-DDTHH:MM:SS`. Tests drive time explicitly through [`ManualClock`].

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

/// Timestamp format used for every persisted time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Date format used for production tallies.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Source of the current local time.
pub trait Clock: Send + Sync {
    /// Returns the current local time.
    fn now(&self) -> NaiveDateTime;

    /// Returns the current calendar date.
    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// The system's local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use plcwatch::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::at(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(23, 59, 0).unwrap());
/// clock.advance(chrono::Duration::minutes(2));
/// assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    /// Moves the clock forward (or back, for negative durations).
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

/// Formats a timestamp for storage.
pub fn format_timestamp(time: NaiveDateTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a stored timestamp.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

/// Formats a date for storage.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        let text = format_timestamp(time);
        assert_eq!(text, "2024-03-09T07:05:01");
        assert_eq!(parse_timestamp(&text), Some(time));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let clock = ManualClock::at(start);
        let other = clock.clone();
        other.advance(ChronoDuration::days(1));
        assert_eq!(format_date(clock.today()), "2024-01-02");
    }
}
