//! Intelligent timing for proactive follow-ups.
//!
//! [`TimingEngine::decide`] is a pure function of the candidate, the current
//! time, the pacing counters and a caller-supplied jitter. Rules run in a
//! fixed order and the first match wins:
//!
//! 0. concern no longer active → `suppress`
//! 1. critical urgency → `send_now`
//! 2. inside quiet hours → `defer` to the end of quiet hours plus jitter
//! 3. subject already at the hourly notification cap → `defer` by the pacing gap
//! 4. otherwise → `send_now`

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::LocalTime;
use crate::concern::{ConcernStatus, Urgency};
use crate::routine::QuietHours;

/// What to do with a candidate right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingAction {
    SendNow,
    Defer,
    Suppress,
}

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingReason {
    Inactive,
    Critical,
    QuietHours,
    RateLimited,
    Clear,
}

impl fmt::Display for TimingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inactive => "concern no longer active",
            Self::Critical => "critical urgency",
            Self::QuietHours => "inside quiet hours",
            Self::RateLimited => "hourly notification cap reached",
            Self::Clear => "no constraint applies",
        })
    }
}

/// Transient decision. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingDecision {
    pub action: TimingAction,
    /// Set for `defer`.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub reason: TimingReason,
}

impl TimingDecision {
    fn send_now(reason: TimingReason) -> Self {
        Self {
            action: TimingAction::SendNow,
            scheduled_for: None,
            reason,
        }
    }

    fn defer(until: DateTime<Utc>, reason: TimingReason) -> Self {
        Self {
            action: TimingAction::Defer,
            scheduled_for: Some(until),
            reason,
        }
    }
}

/// Inputs that change per evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TimingContext {
    pub now: DateTime<Utc>,
    pub urgency: Urgency,
    pub status: ConcernStatus,
    /// Notifications already dispatched to this subject in the trailing hour.
    pub dispatched_last_hour: usize,
    /// Added to a quiet-hours deferral.
    pub jitter: Duration,
}

/// Static timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct TimingEngine {
    quiet_hours: Option<QuietHours>,
    local: LocalTime,
    max_notifications_per_hour: usize,
    pacing_gap: Duration,
    jitter_max: Duration,
}

impl TimingEngine {
    pub fn new(
        quiet_hours: Option<QuietHours>,
        local: LocalTime,
        max_notifications_per_hour: usize,
        pacing_gap: Duration,
        jitter_max: Duration,
    ) -> Self {
        Self {
            quiet_hours,
            local,
            max_notifications_per_hour,
            pacing_gap,
            jitter_max,
        }
    }

    /// Quiet-hours window in effect, if any.
    #[must_use]
    pub fn quiet_hours(&self) -> Option<QuietHours> {
        self.quiet_hours
    }

    /// Evaluate the rules in order.
    #[must_use]
    pub fn decide(&self, ctx: &TimingContext) -> TimingDecision {
        let decision = self.evaluate(ctx);
        debug!(
            action = ?decision.action,
            scheduled_for = ?decision.scheduled_for,
            reason = %decision.reason,
            urgency = %ctx.urgency,
            "timing decision"
        );
        decision
    }

    fn evaluate(&self, ctx: &TimingContext) -> TimingDecision {
        if ctx.status != ConcernStatus::Active {
            return TimingDecision {
                action: TimingAction::Suppress,
                scheduled_for: None,
                reason: TimingReason::Inactive,
            };
        }

        if ctx.urgency == Urgency::Critical {
            return TimingDecision::send_now(TimingReason::Critical);
        }

        if let Some(quiet) = self.quiet_hours {
            if quiet.contains(self.local.time_of_day(ctx.now)) {
                let jitter = ctx.jitter.max(Duration::zero());
                let until = quiet.end_after(ctx.now, self.local) + jitter;
                return TimingDecision::defer(until, TimingReason::QuietHours);
            }
        }

        if ctx.dispatched_last_hour >= self.max_notifications_per_hour {
            return TimingDecision::defer(ctx.now + self.pacing_gap, TimingReason::RateLimited);
        }

        TimingDecision::send_now(TimingReason::Clear)
    }

    /// Uniform jitter in `[0, jitter_max]`, whole seconds.
    pub fn random_jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let max = self.jitter_max.num_seconds();
        if max <= 0 {
            return Duration::zero();
        }
        Duration::seconds(rng.gen_range(0..=max))
    }
}
