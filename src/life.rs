//! Life-state machine.
//!
//! Tracks the agent's coarse operating mode. The scheduling loop is the only
//! writer: it feeds routine matches, user-message overrides and dream ticks,
//! and every resulting transition is recorded as `(from, to, trigger, at)`.
//!
//! `Dreaming` is a sub-mode of `Sleeping`, held as a flag rather than a
//! top-level state: a dream starts and ends without a transition record.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::routine::Routine;

/// Number of transitions kept in memory for inspection.
const TRANSITION_HISTORY_LIMIT: usize = 256;

/// Coarse operating mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeState {
    Sleeping,
    WakingUp,
    Active,
    Focused,
    Idle,
    Contemplating,
    Socializing,
    Learning,
    Dreaming,
}

impl LifeState {
    /// Stable snake_case name, as persisted.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sleeping => "sleeping",
            Self::WakingUp => "waking_up",
            Self::Active => "active",
            Self::Focused => "focused",
            Self::Idle => "idle",
            Self::Contemplating => "contemplating",
            Self::Socializing => "socializing",
            Self::Learning => "learning",
            Self::Dreaming => "dreaming",
        }
    }

    /// Parse a persisted name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sleeping" => Self::Sleeping,
            "waking_up" => Self::WakingUp,
            "active" => Self::Active,
            "focused" => Self::Focused,
            "idle" => Self::Idle,
            "contemplating" => Self::Contemplating,
            "socializing" => Self::Socializing,
            "learning" => Self::Learning,
            "dreaming" => Self::Dreaming,
            _ => return None,
        })
    }
}

impl std::fmt::Display for LifeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionTrigger {
    /// A routine window matched.
    Routine {
        /// Routine name.
        name: String,
    },
    /// The fixed wake-up dwell elapsed.
    WakeDwell,
    /// A user message forced the agent awake.
    UserMessage,
}

impl std::fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Routine { name } => write!(f, "routine:{name}"),
            Self::WakeDwell => write!(f, "wake_dwell"),
            Self::UserMessage => write!(f, "user_message"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: LifeState,
    pub to: LifeState,
    pub trigger: TransitionTrigger,
    pub at: DateTime<Utc>,
}

/// Dream sub-mode change reported by [`LifeStateMachine::advance_dream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DreamChange {
    Started,
    Ended,
}

/// Result of a user-message override request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceOutcome {
    /// The agent moved to `Active`.
    Transitioned(Transition),
    /// Already `Active`; the override hold was extended.
    AlreadyActive,
    /// A dream is in progress and must not be interrupted.
    Held,
}

/// Persisted view of the machine, overwritten in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeSnapshot {
    pub current_state: LifeState,
    pub entered_at: DateTime<Utc>,
    pub dream_flag: bool,
    #[serde(default)]
    pub dream_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub override_until: Option<DateTime<Utc>>,
    /// End of the most recent dream; spaces the next one.
    #[serde(default)]
    pub last_dream_at: Option<DateTime<Utc>>,
}

/// Fixed durations governing the machine.
#[derive(Debug, Clone, Copy)]
pub struct LifeTimings {
    /// Time spent in `WakingUp` before moving to `Active`.
    pub wake_dwell: Duration,
    /// How long a user-forced `Active` suppresses routine re-evaluation.
    pub user_override: Duration,
    /// Interval between dream starts while sleeping.
    pub dream_interval: Duration,
    /// Length of one dream.
    pub dream_duration: Duration,
}

impl Default for LifeTimings {
    fn default() -> Self {
        Self {
            wake_dwell: Duration::minutes(5),
            user_override: Duration::minutes(15),
            dream_interval: Duration::minutes(90),
            dream_duration: Duration::minutes(15),
        }
    }
}

/// Finite state machine over [`LifeState`].
#[derive(Debug, Clone)]
pub struct LifeStateMachine {
    current: LifeState,
    entered_at: DateTime<Utc>,
    dream_started_at: Option<DateTime<Utc>>,
    last_dream_at: Option<DateTime<Utc>>,
    override_until: Option<DateTime<Utc>>,
    timings: LifeTimings,
    history: VecDeque<Transition>,
}

impl LifeStateMachine {
    /// Start in `initial` at `at`.
    pub fn new(initial: LifeState, at: DateTime<Utc>, timings: LifeTimings) -> Self {
        let current = if initial == LifeState::Dreaming {
            LifeState::Sleeping
        } else {
            initial
        };
        Self {
            current,
            entered_at: at,
            dream_started_at: None,
            last_dream_at: None,
            override_until: None,
            timings,
            history: VecDeque::new(),
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(snapshot: &LifeSnapshot, timings: LifeTimings) -> Self {
        let mut machine = Self::new(snapshot.current_state, snapshot.entered_at, timings);
        if snapshot.dream_flag && machine.current == LifeState::Sleeping {
            machine.dream_started_at = Some(snapshot.dream_started_at.unwrap_or(snapshot.entered_at));
        }
        machine.override_until = snapshot.override_until;
        machine.last_dream_at = snapshot.last_dream_at;
        machine
    }

    /// Current top-level state.
    #[must_use]
    pub fn state(&self) -> LifeState {
        self.current
    }

    /// When the current state was entered.
    #[must_use]
    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Whether a dream is in progress.
    #[must_use]
    pub fn is_dreaming(&self) -> bool {
        self.dream_started_at.is_some()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Persistable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> LifeSnapshot {
        LifeSnapshot {
            current_state: self.current,
            entered_at: self.entered_at,
            dream_flag: self.is_dreaming(),
            dream_started_at: self.dream_started_at,
            override_until: self.override_until,
            last_dream_at: self.last_dream_at,
        }
    }

    /// Apply the routine in effect at `now`, if any.
    ///
    /// At most one transition per call. Re-evaluating a window whose target
    /// is already current is a no-op.
    pub fn evaluate_routine(
        &mut self,
        routine: Option<&Routine>,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if let Some(until) = self.override_until {
            if now < until {
                return None;
            }
            self.override_until = None;
        }

        // A wake boundary waits for the running dream to finish.
        if self.is_dreaming() {
            return None;
        }

        let routine = routine?;
        let target = routine.state;
        let by_routine = || TransitionTrigger::Routine {
            name: routine.name.clone(),
        };

        match self.current {
            LifeState::Sleeping if target != LifeState::Sleeping => {
                Some(self.transition(LifeState::WakingUp, by_routine(), now))
            }
            LifeState::WakingUp if target == LifeState::Sleeping => {
                Some(self.transition(LifeState::Sleeping, by_routine(), now))
            }
            LifeState::WakingUp => {
                if now - self.entered_at >= self.timings.wake_dwell {
                    Some(self.transition(LifeState::Active, TransitionTrigger::WakeDwell, now))
                } else {
                    None
                }
            }
            current if current == target => None,
            _ => Some(self.transition(target, by_routine(), now)),
        }
    }

    /// Force the agent awake for a user message.
    pub fn force_active(&mut self, now: DateTime<Utc>) -> ForceOutcome {
        if self.is_dreaming() {
            debug!("user message held; dream in progress");
            return ForceOutcome::Held;
        }
        self.override_until = Some(now + self.timings.user_override);
        if self.current == LifeState::Active {
            return ForceOutcome::AlreadyActive;
        }
        ForceOutcome::Transitioned(self.transition(
            LifeState::Active,
            TransitionTrigger::UserMessage,
            now,
        ))
    }

    /// Start or finish a dream.
    ///
    /// A dream starts only while `Sleeping`, when `permitted`, and once
    /// `dream_interval` has passed since falling asleep or the last dream.
    pub fn advance_dream(&mut self, now: DateTime<Utc>, permitted: bool) -> Option<DreamChange> {
        if let Some(started) = self.dream_started_at {
            if now - started >= self.timings.dream_duration {
                self.dream_started_at = None;
                self.last_dream_at = Some(now);
                info!(at = %now, "dream ended");
                return Some(DreamChange::Ended);
            }
            return None;
        }

        if self.current != LifeState::Sleeping || !permitted {
            return None;
        }

        let since = self
            .last_dream_at
            .map_or(self.entered_at, |last| last.max(self.entered_at));
        if now - since >= self.timings.dream_interval {
            self.dream_started_at = Some(now);
            info!(at = %now, "dream started");
            return Some(DreamChange::Started);
        }
        None
    }

    fn transition(
        &mut self,
        to: LifeState,
        trigger: TransitionTrigger,
        at: DateTime<Utc>,
    ) -> Transition {
        let record = Transition {
            from: self.current,
            to,
            trigger,
            at,
        };
        info!(
            from = %record.from,
            to = %record.to,
            trigger = %record.trigger,
            at = %record.at,
            "life state transition"
        );
        self.current = to;
        self.entered_at = at;
        self.history.push_back(record.clone());
        if self.history.len() > TRANSITION_HISTORY_LIMIT {
            self.history.pop_front();
        }
        record
    }
}
