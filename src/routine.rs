//! Routine table: time-of-day windows mapped to life states.
//!
//! Windows are half-open `[start, end)` in local time and may wrap across
//! midnight (`22:00`–`07:00`). The table is validated once at startup;
//! overlapping windows are a configuration error, never silently resolved.

use chrono::{DateTime, Days, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::LocalTime;
use crate::error::{EngineError, Result};
use crate::life::LifeState;

const SECS_PER_DAY: u32 = 86_400;

/// Things the agent may do while a routine is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    /// Reply to the user with a generated response.
    Converse,
    /// Check back on tracked concerns.
    FollowUp,
    /// Run scheduled proactive tasks.
    Proactive,
    /// Reflect on goals and the day.
    Reflect,
    /// Background learning / research.
    Learn,
    /// Dream synthesis while sleeping.
    Dream,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converse => write!(f, "converse"),
            Self::FollowUp => write!(f, "follow_up"),
            Self::Proactive => write!(f, "proactive"),
            Self::Reflect => write!(f, "reflect"),
            Self::Learn => write!(f, "learn"),
            Self::Dream => write!(f, "dream"),
        }
    }
}

/// A configured time window mapped to a life state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    /// Human-readable name (e.g. `"deep work"`).
    pub name: String,
    /// Local start time, inclusive.
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// Local end time, exclusive. Earlier than `start` means the window wraps midnight.
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Life state the agent should be in during this window.
    pub state: LifeState,
    /// Activities permitted during this window.
    #[serde(default)]
    pub activities: Vec<Activity>,
}

impl Routine {
    /// Create a routine. Times are `(hour, minute)` pairs.
    pub fn new(
        name: impl Into<String>,
        start: (u32, u32),
        end: (u32, u32),
        state: LifeState,
        activities: &[Activity],
    ) -> Self {
        Self {
            name: name.into(),
            start: hm(start.0, start.1),
            end: hm(end.0, end.1),
            state,
            activities: activities.to_vec(),
        }
    }

    /// Returns `true` if `time` falls inside this window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        window_contains(self.start, self.end, time)
    }

    /// Returns `true` if `activity` is permitted during this window.
    #[must_use]
    pub fn permits(&self, activity: Activity) -> bool {
        self.activities.contains(&activity)
    }

    fn segments(&self) -> Vec<(u32, u32)> {
        let s = self.start.num_seconds_from_midnight();
        let e = self.end.num_seconds_from_midnight();
        if s < e {
            vec![(s, e)]
        } else {
            vec![(s, SECS_PER_DAY), (0, e)]
        }
    }
}

/// Quiet-hours window during which only critical notifications go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    /// Local start time, inclusive.
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// Local end time, exclusive.
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    /// Returns `true` if local `time` is inside quiet hours.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        window_contains(self.start, self.end, time)
    }

    /// First instant at or after `now` at which quiet hours end.
    pub fn end_after(&self, now: DateTime<Utc>, local: LocalTime) -> DateTime<Utc> {
        let date = local.date(now);
        let time = local.time_of_day(now);
        let end_date = if time < self.end {
            date
        } else {
            date.checked_add_days(Days::new(1)).unwrap_or(date)
        };
        local.instant(end_date, self.end)
    }
}

/// Validated set of routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineTable {
    routines: Vec<Routine>,
}

impl RoutineTable {
    /// Validate and build a table.
    ///
    /// Fails on empty names, zero-length windows and overlapping windows.
    pub fn new(routines: Vec<Routine>) -> Result<Self> {
        validate(&routines)?;
        Ok(Self { routines })
    }

    /// All routines in configuration order.
    #[must_use]
    pub fn routines(&self) -> &[Routine] {
        &self.routines
    }

    /// The routine in effect at local `time`, if any.
    #[must_use]
    pub fn active_at(&self, time: NaiveTime) -> Option<&Routine> {
        self.routines.iter().find(|r| r.contains(time))
    }

    /// The first routine mapped to [`LifeState::Sleeping`].
    #[must_use]
    pub fn sleeping(&self) -> Option<&Routine> {
        self.routines
            .iter()
            .find(|r| r.state == LifeState::Sleeping)
    }

    /// Quiet hours derived from the sleeping routine.
    #[must_use]
    pub fn quiet_hours(&self) -> Option<QuietHours> {
        self.sleeping().map(|r| QuietHours {
            start: r.start,
            end: r.end,
        })
    }
}

impl Default for RoutineTable {
    fn default() -> Self {
        Self {
            routines: default_routines(),
        }
    }
}

/// The stock daily routine.
pub fn default_routines() -> Vec<Routine> {
    use Activity::*;
    vec![
        Routine::new("sleep", (22, 0), (7, 0), LifeState::Sleeping, &[Dream]),
        Routine::new(
            "morning",
            (7, 0),
            (9, 0),
            LifeState::Active,
            &[Converse, FollowUp, Proactive],
        ),
        Routine::new(
            "deep work",
            (9, 0),
            (12, 0),
            LifeState::Focused,
            &[Converse, FollowUp],
        ),
        Routine::new(
            "lunch",
            (12, 0),
            (13, 0),
            LifeState::Socializing,
            &[Converse, FollowUp, Proactive],
        ),
        Routine::new(
            "afternoon",
            (13, 0),
            (17, 0),
            LifeState::Focused,
            &[Converse, FollowUp],
        ),
        Routine::new(
            "study",
            (17, 0),
            (19, 0),
            LifeState::Learning,
            &[Converse, FollowUp, Learn],
        ),
        Routine::new(
            "evening",
            (19, 0),
            (20, 0),
            LifeState::Idle,
            &[Converse, FollowUp, Proactive, Learn],
        ),
        Routine::new(
            "reflection",
            (20, 0),
            (22, 0),
            LifeState::Contemplating,
            &[Converse, FollowUp, Reflect],
        ),
    ]
}

fn validate(routines: &[Routine]) -> Result<()> {
    for r in routines {
        if r.name.trim().is_empty() {
            return Err(EngineError::Config("routine with empty name".to_owned()));
        }
        if r.start == r.end {
            return Err(EngineError::Config(format!(
                "routine '{}' has a zero-length window",
                r.name
            )));
        }
        if matches!(r.state, LifeState::WakingUp | LifeState::Dreaming) {
            return Err(EngineError::Config(format!(
                "routine '{}' targets transient state {}",
                r.name, r.state
            )));
        }
    }

    for (i, a) in routines.iter().enumerate() {
        for b in routines.iter().skip(i + 1) {
            let overlaps = a.segments().iter().any(|&(a1, a2)| {
                b.segments()
                    .iter()
                    .any(|&(b1, b2)| a1 < b2 && b1 < a2)
            });
            if overlaps {
                return Err(EngineError::Config(format!(
                    "routines '{}' and '{}' overlap",
                    a.name, b.name
                )));
            }
        }
    }

    let sleeping = routines
        .iter()
        .filter(|r| r.state == LifeState::Sleeping)
        .count();
    if sleeping > 1 {
        return Err(EngineError::Config(
            "more than one sleeping routine; quiet hours are ambiguous".to_owned(),
        ));
    }
    Ok(())
}

fn window_contains(start: NaiveTime, end: NaiveTime, time: NaiveTime) -> bool {
    if start < end {
        time >= start && time < end
    } else {
        time >= start || time < end
    }
}

fn hm(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour.min(23), min.min(59), 0).unwrap_or(NaiveTime::MIN)
}

/// `"HH:MM"` serde representation for [`NaiveTime`].
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(serde::de::Error::custom)
    }
}
