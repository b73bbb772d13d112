//! Concern lifecycle management.
//!
//! Creates concerns from classifier candidates, answers the "what is due"
//! query, advances follow-up counters with exponential backoff, retires
//! concerns as resolved or abandoned, and runs resolution detection on new
//! interactions from the same subject.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{Concern, ConcernStatus, FollowUpCandidate, TopicPolicies};
use crate::collaborators::{Interaction, ResolutionClassifier, call_with_timeout};
use crate::error::Result;
use crate::store::StateStore;

/// Outcome of recording a sent follow-up.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUpProgress {
    /// Another check is scheduled.
    Rescheduled { next_check_at: DateTime<Utc> },
    /// The follow-up cap was reached; the concern is now abandoned.
    Abandoned,
}

/// Owns every mutation of [`Concern`] records for one agent.
pub struct ConcernTracker {
    store: Arc<dyn StateStore>,
    owner_id: String,
    policies: TopicPolicies,
    resolution_confidence: f32,
}

impl ConcernTracker {
    /// Create a tracker for `owner_id`.
    pub fn new(
        store: Arc<dyn StateStore>,
        owner_id: impl Into<String>,
        policies: TopicPolicies,
        resolution_confidence: f32,
    ) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            policies,
            resolution_confidence: resolution_confidence.clamp(0.0, 1.0),
        }
    }

    /// Topic policies in effect.
    #[must_use]
    pub fn policies(&self) -> &TopicPolicies {
        &self.policies
    }

    /// Start tracking a follow-up candidate.
    ///
    /// The suggested delay is clamped to the topic bounds. The record and its
    /// first `next_check_at` are written in one transaction.
    pub fn track(
        &self,
        subject_id: &str,
        candidate: &FollowUpCandidate,
        now: DateTime<Utc>,
    ) -> Result<Concern> {
        let policy = self.policies.get(candidate.topic);
        let delay = policy.clamp_delay(candidate.suggested_delay_secs);
        if delay.num_seconds() != candidate.suggested_delay_secs {
            debug!(
                topic = %candidate.topic,
                suggested = candidate.suggested_delay_secs,
                clamped = delay.num_seconds(),
                "follow-up delay clamped"
            );
        }

        let concern = Concern {
            concern_id: Uuid::new_v4().to_string(),
            owner_id: self.owner_id.clone(),
            subject_id: subject_id.to_owned(),
            topic: candidate.topic,
            subject_text: candidate.subject_text.trim().to_owned(),
            severity: candidate.severity.clamp(0.0, 1.0),
            urgency: candidate.urgency,
            status: ConcernStatus::Active,
            next_check_at: Some(now + delay),
            follow_up_count: 0,
            max_follow_ups: policy.max_follow_ups,
            base_delay_secs: delay.num_seconds(),
            created_at: now,
            updated_at: now,
            resolved_at: None,
            last_message_ref: None,
        };
        self.store.insert_concern(&concern)?;
        info!(
            concern_id = %concern.concern_id,
            subject_id,
            topic = %concern.topic,
            urgency = %concern.urgency,
            next_check_at = ?concern.next_check_at,
            "tracking new concern"
        );
        Ok(concern)
    }

    /// Fetch one concern.
    pub fn get(&self, concern_id: &str) -> Result<Option<Concern>> {
        self.store.get_concern(concern_id)
    }

    /// Active concerns for one subject.
    pub fn active_for_subject(&self, subject_id: &str) -> Result<Vec<Concern>> {
        self.store
            .active_concerns_for_subject(&self.owner_id, subject_id)
    }

    /// Active concerns whose `next_check_at` is at or before `now`.
    ///
    /// Records that already hit their follow-up cap are forced to
    /// `abandoned` here and left out of the result.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Concern>> {
        let mut due = Vec::new();
        for mut concern in self.store.due_concerns(&self.owner_id, now)? {
            if concern.follow_up_count >= concern.max_follow_ups {
                if let Err(violation) = concern.check_invariants() {
                    error!(concern_id = %concern.concern_id, "{violation}; forcing abandoned");
                } else {
                    warn!(
                        concern_id = %concern.concern_id,
                        "active concern at follow-up cap; abandoning"
                    );
                }
                self.abandon(&mut concern, now, "follow-up cap reached (repair)")?;
                continue;
            }
            due.push(concern);
        }
        Ok(due)
    }

    /// Record that a follow-up was delivered.
    ///
    /// Increments `follow_up_count`; at the cap the concern is abandoned,
    /// otherwise `next_check_at` backs off exponentially.
    pub fn record_follow_up(
        &self,
        concern: &mut Concern,
        message_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FollowUpProgress> {
        concern.follow_up_count = concern.follow_up_count.saturating_add(1);
        concern.last_message_ref = message_ref;

        if concern.follow_up_count >= concern.max_follow_ups {
            self.abandon(concern, now, "follow-up cap reached")?;
            info!(
                concern_id = %concern.concern_id,
                follow_ups = concern.follow_up_count,
                "concern abandoned after final follow-up"
            );
            return Ok(FollowUpProgress::Abandoned);
        }

        let policy = self.policies.get(concern.topic);
        let next = now + policy.backoff_delay(concern.base_delay_secs, concern.follow_up_count);
        concern.next_check_at = Some(next);
        concern.updated_at = now;
        self.store
            .update_concern(concern, &format!("follow-up #{}", concern.follow_up_count))?;
        debug!(
            concern_id = %concern.concern_id,
            follow_ups = concern.follow_up_count,
            next_check_at = %next,
            "follow-up recorded"
        );
        Ok(FollowUpProgress::Rescheduled {
            next_check_at: next,
        })
    }

    /// Move `next_check_at` to `until` without counting a follow-up.
    ///
    /// `until` is pushed to at least one second after `now`.
    pub fn reschedule(
        &self,
        concern: &mut Concern,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        if !concern.is_active() {
            return Ok(());
        }
        let until = until.max(now + Duration::seconds(1));
        concern.next_check_at = Some(until);
        concern.updated_at = now;
        self.store
            .update_concern(concern, &format!("rescheduled: {reason}"))?;
        debug!(concern_id = %concern.concern_id, %until, reason, "concern rescheduled");
        Ok(())
    }

    /// Mark a concern resolved and cancel its pending check.
    ///
    /// Returns `false` if it was not active.
    pub fn resolve(&self, concern_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut concern) = self.store.get_concern(concern_id)? else {
            return Ok(false);
        };
        if !concern.is_active() {
            return Ok(false);
        }
        concern.status = ConcernStatus::Resolved;
        concern.resolved_at = Some(now);
        concern.next_check_at = None;
        concern.updated_at = now;
        self.store.update_concern(&concern, "resolved")?;
        info!(concern_id, subject_id = %concern.subject_id, "concern resolved");
        Ok(true)
    }

    /// Match an interaction against the subject's active concerns and
    /// resolve those the classifier reports as closed.
    ///
    /// Classifier failures are logged per concern and do not stop the scan.
    pub async fn detect_resolutions(
        &self,
        interaction: &Interaction,
        classifier: &dyn ResolutionClassifier,
        timeout: StdDuration,
    ) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        for concern in self.active_for_subject(&interaction.subject_id)? {
            let verdict = call_with_timeout(
                timeout,
                "resolution classifier",
                classifier.check_resolution(interaction, &concern),
            )
            .await;
            match verdict {
                Ok(v) if v.resolved && v.confidence >= self.resolution_confidence => {
                    if self.resolve(&concern.concern_id, interaction.at)? {
                        resolved.push(concern.concern_id);
                    }
                }
                Ok(v) => debug!(
                    concern_id = %concern.concern_id,
                    resolved = v.resolved,
                    confidence = v.confidence,
                    "concern still open"
                ),
                Err(e) => warn!(
                    concern_id = %concern.concern_id,
                    "resolution check failed: {e}"
                ),
            }
        }
        Ok(resolved)
    }

    /// Delete resolved/abandoned concerns closed before `now - retention`.
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let removed = self
            .store
            .sweep_closed_concerns(&self.owner_id, now - retention)?;
        if removed > 0 {
            info!(removed, "retention sweep deleted closed concerns");
        }
        Ok(removed)
    }

    /// Explicitly delete a concern.
    pub fn delete(&self, concern_id: &str) -> Result<bool> {
        self.store.delete_concern(concern_id)
    }

    fn abandon(&self, concern: &mut Concern, now: DateTime<Utc>, note: &str) -> Result<()> {
        concern.status = ConcernStatus::Abandoned;
        concern.next_check_at = None;
        concern.updated_at = now;
        concern.follow_up_count = concern.follow_up_count.min(concern.max_follow_ups);
        self.store.update_concern(concern, note)
    }
}
