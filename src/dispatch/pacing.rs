//! Per-subject notification pacing.
//!
//! A sliding one-hour window of successful dispatch timestamps per subject.
//! The timing engine reads the count; the scheduling loop records every
//! dispatch that reached at least one channel.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::store::DeliveryRecord;

/// Sliding window of dispatch timestamps keyed by subject.
#[derive(Debug, Clone)]
pub struct PacingWindow {
    span: Duration,
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl Default for PacingWindow {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl PacingWindow {
    #[must_use]
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            windows: HashMap::new(),
        }
    }

    /// Width of the window.
    #[must_use]
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Rebuild from the delivery log.
    ///
    /// Rows sharing a subject and timestamp are one fan-out dispatch and
    /// count once. Failed rows are ignored.
    pub fn seed<'a>(&mut self, records: impl IntoIterator<Item = &'a DeliveryRecord>) {
        let mut seen = HashSet::new();
        let mut stamps: Vec<(&str, DateTime<Utc>)> = records
            .into_iter()
            .filter(|r| r.delivered)
            .filter(|r| seen.insert((r.subject_id.as_str(), r.at)))
            .map(|r| (r.subject_id.as_str(), r.at))
            .collect();
        stamps.sort_by_key(|(_, at)| *at);
        for (subject, at) in stamps {
            self.record(subject, at);
        }
    }

    /// Record one dispatch to `subject_id` at `at`.
    pub fn record(&mut self, subject_id: &str, at: DateTime<Utc>) {
        self.windows
            .entry(subject_id.to_owned())
            .or_default()
            .push_back(at);
    }

    /// Dispatches to `subject_id` within the window ending at `now`.
    pub fn count(&mut self, subject_id: &str, now: DateTime<Utc>) -> usize {
        let window_start = now - self.span;
        let Some(window) = self.windows.get_mut(subject_id) else {
            return 0;
        };
        while let Some(&first) = window.front() {
            if first <= window_start {
                window.pop_front();
            } else {
                break;
            }
        }
        let count = window.iter().filter(|at| **at <= now).count();
        if window.is_empty() {
            self.windows.remove(subject_id);
        }
        count
    }
}
