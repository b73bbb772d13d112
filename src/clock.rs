//! Time source.
//!
//! Everything in the engine asks a [`Clock`] for "now" instead of calling
//! `Utc::now()` directly, so tests can drive the scheduler with a
//! [`ManualClock`] and jump across days deterministically.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

/// Wall-clock provider.
pub trait Clock: Send + Sync {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Set the current instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Move the clock forward (or backward, for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Local-time view of UTC instants for a fixed UTC offset.
///
/// Routine windows and budget days are expressed in the agent's local time.
#[derive(Debug, Clone, Copy)]
pub struct LocalTime {
    offset: FixedOffset,
}

impl LocalTime {
    /// Build from an offset in minutes east of UTC. Out-of-range values fall back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset =
            FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    /// UTC local time.
    pub fn utc() -> Self {
        Self::from_offset_minutes(0)
    }

    /// Local calendar date of `at`.
    pub fn date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Local time of day of `at`.
    pub fn time_of_day(&self, at: DateTime<Utc>) -> NaiveTime {
        at.with_timezone(&self.offset).time()
    }

    /// UTC instant of `time` on local `date`.
    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        // A fixed offset has no gaps or folds, so subtracting it is exact.
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, Utc)
    }
}
