//! Concern data types.
//!
//! A [`Concern`] is something a subject mentioned that is worth checking back
//! on later. Topics form a closed set; each topic carries its own delay
//! clamps, backoff ceiling and follow-up cap via [`TopicPolicy`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MAX_SPAN_SECS;

/// What a concern is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Health,
    Emotion,
    Task,
    Work,
    Social,
    Dream,
    General,
}

impl Topic {
    /// Every topic, in declaration order.
    pub const ALL: [Topic; 7] = [
        Topic::Health,
        Topic::Emotion,
        Topic::Task,
        Topic::Work,
        Topic::Social,
        Topic::Dream,
        Topic::General,
    ];

    /// Stable snake_case name, as persisted.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Emotion => "emotion",
            Self::Task => "task",
            Self::Work => "work",
            Self::Social => "social",
            Self::Dream => "dream",
            Self::General => "general",
        }
    }

    /// Parse a persisted name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How soon a concern needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Normal,
    Low,
}

impl Urgency {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "critical" => Self::Critical,
            "high" => Self::High,
            "normal" => Self::Normal,
            "low" => Self::Low,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernStatus {
    /// Follow-ups are scheduled.
    Active,
    /// The subject reported it closed.
    Resolved,
    /// Follow-up cap reached without resolution. Kept for audit.
    Abandoned,
}

impl ConcernStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => Self::Active,
            "resolved" => Self::Resolved,
            "abandoned" => Self::Abandoned,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ConcernStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted record of something worth checking back on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concern {
    pub concern_id: String,
    /// Agent that owns the record.
    pub owner_id: String,
    /// End user the concern is about.
    pub subject_id: String,
    pub topic: Topic,
    pub subject_text: String,
    /// 0.0–1.0.
    pub severity: f32,
    pub urgency: Urgency,
    pub status: ConcernStatus,
    /// `None` once resolved or abandoned.
    pub next_check_at: Option<DateTime<Utc>>,
    pub follow_up_count: u32,
    pub max_follow_ups: u32,
    /// Clamped initial delay; backoff doubles from here.
    pub base_delay_secs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reference to the last follow-up message sent.
    pub last_message_ref: Option<String>,
}

impl Concern {
    /// Returns `true` while follow-ups are still scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ConcernStatus::Active
    }

    /// Check the persisted-record invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status != ConcernStatus::Abandoned && self.follow_up_count > self.max_follow_ups {
            return Err(format!(
                "concern {} has follow_up_count {} > max_follow_ups {}",
                self.concern_id, self.follow_up_count, self.max_follow_ups
            ));
        }
        if self.is_active() && self.next_check_at.is_none() {
            return Err(format!(
                "active concern {} has no next_check_at",
                self.concern_id
            ));
        }
        Ok(())
    }

    /// Text used when no generation budget is available.
    #[must_use]
    pub fn template_message(&self) -> String {
        let about = self.subject_text.trim();
        match self.topic {
            Topic::Health => format!("Checking in: how are you feeling about {about}?"),
            Topic::Emotion => format!("I've been thinking about you. How are things with {about}?"),
            Topic::Task => format!("How is it going with {about}? Anything I can help with?"),
            Topic::Work => format!("Any progress on {about}? Let me know if the deadline moved."),
            Topic::Social => format!("How did things go with {about}?"),
            Topic::Dream => format!("Something from last night stayed with me: {about}."),
            Topic::General => format!("Just following up on {about}."),
        }
    }

    /// Instruction handed to the completion service for a follow-up.
    #[must_use]
    pub fn generation_brief(&self) -> String {
        let tone = match self.topic {
            Topic::Health => "caring and brief; never give medical advice",
            Topic::Emotion => "warm and unhurried",
            Topic::Task | Topic::Work => "practical, offer concrete help",
            Topic::Social => "friendly and curious",
            Topic::Dream => "reflective, share the thought lightly",
            Topic::General => "casual",
        };
        format!(
            "Write a short follow-up to the user about \"{}\" (topic: {}, follow-up #{} of {}). Tone: {}.",
            self.subject_text.trim(),
            self.topic,
            self.follow_up_count + 1,
            self.max_follow_ups,
            tone
        )
    }
}

/// Classifier output describing a follow-up worth scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpCandidate {
    pub topic: Topic,
    pub subject_text: String,
    pub severity: f32,
    pub urgency: Urgency,
    /// Delay suggested by the classifier. Clamped before use.
    pub suggested_delay_secs: i64,
}

/// Per-topic scheduling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPolicy {
    pub min_delay_secs: i64,
    pub max_delay_secs: i64,
    pub backoff_cap_secs: i64,
    pub max_follow_ups: u32,
}

impl TopicPolicy {
    const fn hours(min_h: i64, max_h: i64, cap_h: i64, max_follow_ups: u32) -> Self {
        Self {
            min_delay_secs: min_h * 3600,
            max_delay_secs: max_h * 3600,
            backoff_cap_secs: cap_h * 3600,
            max_follow_ups,
        }
    }

    /// Clamp a suggested delay into `[min_delay, max_delay]`.
    #[must_use]
    pub fn clamp_delay(&self, suggested_secs: i64) -> Duration {
        Duration::seconds(suggested_secs.clamp(self.min_delay_secs, self.max_delay_secs))
    }

    /// Delay after the `count`-th follow-up: `base * 2^count`, capped.
    #[must_use]
    pub fn backoff_delay(&self, base_secs: i64, count: u32) -> Duration {
        let factor = 1_i64.checked_shl(count.min(30)).unwrap_or(i64::MAX);
        let secs = base_secs
            .max(1)
            .saturating_mul(factor)
            .min(self.backoff_cap_secs.max(self.min_delay_secs).max(1));
        Duration::seconds(secs)
    }

    pub(crate) fn validate(&self, topic: Topic) -> Result<(), String> {
        if self.min_delay_secs <= 0 {
            return Err(format!("{topic}: min_delay_secs must be positive"));
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err(format!("{topic}: min_delay_secs exceeds max_delay_secs"));
        }
        if self.backoff_cap_secs < self.min_delay_secs {
            return Err(format!("{topic}: backoff_cap_secs below min_delay_secs"));
        }
        if self.max_delay_secs > MAX_SPAN_SECS || self.backoff_cap_secs > MAX_SPAN_SECS {
            return Err(format!("{topic}: delays must not exceed {MAX_SPAN_SECS} seconds"));
        }
        if self.max_follow_ups == 0 {
            return Err(format!("{topic}: max_follow_ups must be at least 1"));
        }
        Ok(())
    }
}

/// Policies for every topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicPolicies {
    pub health: TopicPolicy,
    pub emotion: TopicPolicy,
    pub task: TopicPolicy,
    pub work: TopicPolicy,
    pub social: TopicPolicy,
    pub dream: TopicPolicy,
    pub general: TopicPolicy,
}

impl TopicPolicies {
    /// Policy for `topic`.
    #[must_use]
    pub fn get(&self, topic: Topic) -> &TopicPolicy {
        match topic {
            Topic::Health => &self.health,
            Topic::Emotion => &self.emotion,
            Topic::Task => &self.task,
            Topic::Work => &self.work,
            Topic::Social => &self.social,
            Topic::Dream => &self.dream,
            Topic::General => &self.general,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        Topic::ALL
            .into_iter()
            .try_for_each(|t| self.get(t).validate(t))
    }
}

impl Default for TopicPolicies {
    fn default() -> Self {
        Self {
            health: TopicPolicy {
                min_delay_secs: 30 * 60,
                ..TopicPolicy::hours(0, 24, 24, 3)
            },
            emotion: TopicPolicy::hours(1, 48, 48, 3),
            task: TopicPolicy::hours(1, 7 * 24, 3 * 24, 4),
            work: TopicPolicy::hours(1, 7 * 24, 3 * 24, 4),
            social: TopicPolicy::hours(2, 7 * 24, 7 * 24, 2),
            dream: TopicPolicy::hours(6, 3 * 24, 3 * 24, 1),
            general: TopicPolicy::hours(1, 3 * 24, 3 * 24, 2),
        }
    }
}
