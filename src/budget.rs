//! Daily budget for expensive generation calls.
//!
//! The budget day is the agent's local calendar date. Rollover is computed
//! lazily from the clock on every access, never by a timer, so a process
//! that slept through midnight (or several) still sees a fresh day.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{Clock, LocalTime};
use crate::concern::Topic;
use crate::life::LifeState;
use crate::queue::EventKind;

/// One day's generation accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub date: NaiveDate,
    pub calls_used: u32,
    pub daily_quota: u32,
}

impl BudgetState {
    /// Fresh state for `date`.
    pub fn new(date: NaiveDate, daily_quota: u32) -> Self {
        Self {
            date,
            calls_used: 0,
            daily_quota,
        }
    }

    /// State as seen on `today`.
    ///
    /// A later date starts a fresh day. An earlier date (clock moved
    /// backwards) keeps the current accounting rather than granting quota.
    #[must_use]
    pub fn rolled_over(self, today: NaiveDate) -> Self {
        if today > self.date {
            Self::new(today, self.daily_quota)
        } else {
            self
        }
    }

    /// Calls left today. Never negative, even if usage ran past quota.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.daily_quota.saturating_sub(self.calls_used)
    }
}

/// Whether an event needs budget approval before the heavy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Always approved; usage is still recorded.
    Exempt,
    /// Must win [`BudgetGovernor::try_consume`].
    Required,
    /// Dropped without spending anything.
    Suppressed,
}

/// Budget policy for an event.
///
/// User messages are never throttled. A due-concern event while sleeping is
/// suppressed unless the concern is dream-tagged. Everything else needs
/// approval.
#[must_use]
pub fn approval_policy(kind: EventKind, life: LifeState, topic: Option<Topic>) -> Approval {
    match kind {
        EventKind::UserMessage => Approval::Exempt,
        EventKind::ConcernDue if life == LifeState::Sleeping && topic != Some(Topic::Dream) => {
            Approval::Suppressed
        }
        _ => Approval::Required,
    }
}

/// Tracks and enforces the daily generation quota.
pub struct BudgetGovernor {
    state: BudgetState,
    clock: Arc<dyn Clock>,
    local: LocalTime,
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGovernor")
            .field("state", &self.state)
            .finish()
    }
}

impl BudgetGovernor {
    /// Fresh governor for today.
    pub fn new(daily_quota: u32, clock: Arc<dyn Clock>, local: LocalTime) -> Self {
        let today = local.date(clock.now());
        Self {
            state: BudgetState::new(today, daily_quota),
            clock,
            local,
        }
    }

    /// Resume from persisted state. The configured quota wins over the stored one.
    pub fn restore(
        state: BudgetState,
        daily_quota: u32,
        clock: Arc<dyn Clock>,
        local: LocalTime,
    ) -> Self {
        let mut governor = Self {
            state: BudgetState {
                daily_quota,
                ..state
            },
            clock,
            local,
        };
        governor.roll();
        governor
    }

    fn today(&self) -> NaiveDate {
        self.local.date(self.clock.now())
    }

    fn roll(&mut self) {
        let today = self.today();
        let rolled = self.state.rolled_over(today);
        if rolled.date != self.state.date {
            info!(
                from = %self.state.date,
                to = %rolled.date,
                calls_used = self.state.calls_used,
                "budget day rolled over"
            );
        }
        self.state = rolled;
    }

    /// Spend one call if quota remains today.
    pub fn try_consume(&mut self) -> bool {
        self.roll();
        if self.state.calls_used < self.state.daily_quota {
            self.state.calls_used += 1;
            true
        } else {
            info!(
                quota = self.state.daily_quota,
                date = %self.state.date,
                "generation budget exhausted"
            );
            false
        }
    }

    /// Record an unthrottled call. May push usage past quota.
    pub fn record_unthrottled(&mut self) {
        self.roll();
        self.state.calls_used = self.state.calls_used.saturating_add(1);
    }

    /// Calls left today. Pure read.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.state.rolled_over(self.today()).remaining()
    }

    /// Current state as seen today. Pure read.
    #[must_use]
    pub fn state(&self) -> BudgetState {
        self.state.rolled_over(self.today())
    }
}
