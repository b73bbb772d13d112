//! Engine configuration.
//!
//! Loaded from TOML; every section falls back to product defaults so a
//! partial file is valid. [`EngineConfig::validate`] rejects anything that
//! would make the engine misbehave silently.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::clock::LocalTime;
use crate::concern::TopicPolicies;
use crate::error::{EngineError, Result};
use crate::life::LifeTimings;
use crate::retry::RetryPolicy;
use crate::routine::{QuietHours, Routine, RoutineTable, default_routines};

/// Upper bound for every duration setting given in seconds (one year).
pub const MAX_SPAN_SECS: i64 = 366 * 24 * 3600;

/// Upper bound for `tick_interval_secs` and `generation_timeout_secs`.
pub const MAX_LOOP_SECS: u64 = 3600;

/// Upper bound for `concerns.retention_days`.
pub const MAX_RETENTION_DAYS: i64 = 3650;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: LoopConfig,
    pub budget: BudgetConfig,
    pub pacing: PacingConfig,
    /// Retry policy for completion, classifier and delivery calls.
    pub retry: RetryPolicy,
    pub concerns: ConcernConfig,
    pub routines: Vec<Routine>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: LoopConfig::default(),
            budget: BudgetConfig::default(),
            pacing: PacingConfig::default(),
            retry: RetryPolicy::default(),
            concerns: ConcernConfig::default(),
            routines: default_routines(),
        }
    }
}

/// Scheduling loop and life-state timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Agent (owner) id all persisted state is keyed by.
    pub agent_id: String,
    pub tick_interval_secs: u64,
    /// Maximum events handled per tick.
    pub event_batch_size: usize,
    /// Queue size at which the lowest-priority tail event is evicted.
    pub queue_capacity: usize,
    /// Local time offset used for routines, quiet hours and the budget day.
    pub utc_offset_minutes: i32,
    /// Upper bound on any single completion or classifier call.
    pub generation_timeout_secs: u64,
    /// Dwell in `waking_up` before `active`.
    pub wake_dwell_secs: i64,
    /// How long a user-forced `active` state holds off the routine table.
    pub user_override_secs: i64,
    pub dream_interval_secs: i64,
    pub dream_duration_secs: i64,
    /// Requeue delay for a user message that arrives mid-dream.
    pub dream_hold_secs: i64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_id: "default".to_owned(),
            tick_interval_secs: 30,
            event_batch_size: 32,
            queue_capacity: 1024,
            utc_offset_minutes: 0,
            generation_timeout_secs: 30,
            wake_dwell_secs: 300,
            user_override_secs: 900,
            dream_interval_secs: 5400,
            dream_duration_secs: 900,
            dream_hold_secs: 60,
        }
    }
}

/// Daily generation budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_quota: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { daily_quota: 200 }
    }
}

/// Notification pacing and quiet hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub max_notifications_per_hour: usize,
    pub pacing_gap_secs: i64,
    /// Upper bound of the random delay added to quiet-hours deferrals.
    pub quiet_jitter_max_secs: i64,
    /// Overrides the window derived from the sleeping routine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_notifications_per_hour: 10,
            pacing_gap_secs: 900,
            quiet_jitter_max_secs: 600,
            quiet_hours: None,
        }
    }
}

/// Concern tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcernConfig {
    /// Minimum classifier confidence to resolve a concern.
    pub resolution_confidence: f32,
    /// How far a follow-up is pushed when composing or delivering it fails.
    pub failure_retry_secs: i64,
    /// Closed concerns older than this are swept.
    pub retention_days: i64,
    pub topics: TopicPolicies,
}

impl Default for ConcernConfig {
    fn default() -> Self {
        Self {
            resolution_confidence: 0.6,
            failure_retry_secs: 1800,
            retention_days: 90,
            topics: TopicPolicies::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.agent_id.trim().is_empty() {
            return Err(EngineError::Config("engine.agent_id is empty".to_owned()));
        }
        for (name, value) in [
            ("engine.tick_interval_secs", e.tick_interval_secs),
            ("engine.generation_timeout_secs", e.generation_timeout_secs),
            ("engine.event_batch_size", e.event_batch_size as u64),
            ("engine.queue_capacity", e.queue_capacity as u64),
            (
                "pacing.max_notifications_per_hour",
                self.pacing.max_notifications_per_hour as u64,
            ),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("engine.tick_interval_secs", e.tick_interval_secs),
            ("engine.generation_timeout_secs", e.generation_timeout_secs),
        ] {
            if value > MAX_LOOP_SECS {
                return Err(EngineError::Config(format!(
                    "{name} must not exceed {MAX_LOOP_SECS}"
                )));
            }
        }
        for (name, value) in [
            ("engine.wake_dwell_secs", e.wake_dwell_secs),
            ("engine.user_override_secs", e.user_override_secs),
            ("engine.dream_interval_secs", e.dream_interval_secs),
            ("engine.dream_duration_secs", e.dream_duration_secs),
            ("engine.dream_hold_secs", e.dream_hold_secs),
            ("pacing.pacing_gap_secs", self.pacing.pacing_gap_secs),
            ("pacing.quiet_jitter_max_secs", self.pacing.quiet_jitter_max_secs),
            ("concerns.failure_retry_secs", self.concerns.failure_retry_secs),
        ] {
            if value < 0 {
                return Err(EngineError::Config(format!("{name} must not be negative")));
            }
            if value > MAX_SPAN_SECS {
                return Err(EngineError::Config(format!(
                    "{name} must not exceed {MAX_SPAN_SECS}"
                )));
            }
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&self.concerns.retention_days) {
            return Err(EngineError::Config(format!(
                "concerns.retention_days must be within 0..={MAX_RETENTION_DAYS}"
            )));
        }
        if e.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(EngineError::Config(format!(
                "engine.utc_offset_minutes {} is out of range",
                e.utc_offset_minutes
            )));
        }
        if !(0.0..=1.0).contains(&self.concerns.resolution_confidence) {
            return Err(EngineError::Config(
                "concerns.resolution_confidence must be within 0.0..=1.0".to_owned(),
            ));
        }
        self.concerns
            .topics
            .validate()
            .map_err(|msg| EngineError::Config(format!("concerns.topics.{msg}")))?;
        self.routine_table()?;
        if let Some(q) = self.pacing.quiet_hours {
            if q.start == q.end {
                return Err(EngineError::Config(
                    "pacing.quiet_hours has a zero-length window".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Validated routine table.
    pub fn routine_table(&self) -> Result<RoutineTable> {
        RoutineTable::new(self.routines.clone())
    }

    /// Quiet hours: explicit override, else the sleeping routine's window.
    #[must_use]
    pub fn quiet_hours(&self, table: &RoutineTable) -> Option<QuietHours> {
        self.pacing.quiet_hours.or_else(|| table.quiet_hours())
    }

    #[must_use]
    pub fn local_time(&self) -> LocalTime {
        LocalTime::from_offset_minutes(self.engine.utc_offset_minutes)
    }

    #[must_use]
    pub fn life_timings(&self) -> LifeTimings {
        LifeTimings {
            wake_dwell: Duration::seconds(self.engine.wake_dwell_secs),
            user_override: Duration::seconds(self.engine.user_override_secs),
            dream_interval: Duration::seconds(self.engine.dream_interval_secs),
            dream_duration: Duration::seconds(self.engine.dream_duration_secs),
        }
    }

    #[must_use]
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.engine.tick_interval_secs)
    }

    #[must_use]
    pub fn generation_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.engine.generation_timeout_secs)
    }
}
