//! Per-event handling and the follow-up pipeline.
//!
//! Every handler picks between a heavy path (a completion call charged to
//! the budget) and a light path (template text, no spend). User replies are
//! the exception: they always take the heavy path when a completion service
//! exists and are recorded against the budget without being throttled.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EngineOutput, SchedulingLoop};
use crate::budget::{Approval, approval_policy};
use crate::collaborators::{
    CompletionService, GenerationContext, GenerationPurpose, Interaction, call_with_timeout,
};
use crate::concern::{Concern, FollowUpProgress, Topic, Urgency};
use crate::dispatch::OutboundMessage;
use crate::error::{EngineError, Result};
use crate::life::{ForceOutcome, LifeState};
use crate::queue::{Event, EventKind, EventPayload};
use crate::routine::Activity;
use crate::timing::{TimingAction, TimingContext};

/// Side effects of a user message that already took place. A message
/// retried after a persistence failure skips them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageProgress {
    classified: bool,
    charged: bool,
}

impl SchedulingLoop {
    /// Handle one event, containing its failures.
    ///
    /// A persistence failure holds the event for the persistence backoff
    /// and is returned so the caller can abort the tick. Anything else is
    /// logged and the event is dropped.
    pub(super) async fn handle_contained(&mut self, event: Event, now: DateTime<Utc>) -> Result<()> {
        let event_id = event.id;
        let kind = event.kind();
        match self.handle_event(event.clone(), now).await {
            Ok(()) => {
                self.in_flight.remove(&event_id);
                Ok(())
            }
            Err(e @ EngineError::Persistence(_)) => {
                let backoff = self.persistence_backoff(self.persistence_failures + 1);
                let until = now + Duration::from_std(backoff).unwrap_or_else(|_| Duration::days(1));
                warn!(%event_id, %kind, %until, "persistence failure; event held for retry");
                if let Some(evicted) = self.queue.enqueue_after(event, until) {
                    self.in_flight.remove(&evicted.id);
                }
                Err(e)
            }
            Err(e) => {
                self.in_flight.remove(&event_id);
                error!(%event_id, %kind, "event dropped: {e}");
                Ok(())
            }
        }
    }

    async fn handle_event(&mut self, event: Event, now: DateTime<Utc>) -> Result<()> {
        let kind = event.kind();
        debug!(event_id = %event.id, %kind, priority = event.priority, "handling event");
        match event.payload.clone() {
            EventPayload::UserMessage { subject_id, text } => {
                self.handle_user_message(event, subject_id, text, now).await
            }
            EventPayload::ConcernDue { concern_id, topic } => {
                self.handle_concern_due(event.id, &concern_id, topic, now)
                    .await
            }
            EventPayload::ScheduledTask { task } => {
                self.handle_activity(event.id, kind, Activity::Proactive, &task, now)
                    .await
            }
            EventPayload::GoalCheckpoint { goal } => {
                self.handle_activity(event.id, kind, Activity::Reflect, &goal, now)
                    .await
            }
            EventPayload::RoutineTransition { routine } => {
                self.handle_activity(event.id, kind, Activity::Reflect, &routine, now)
                    .await
            }
        }
    }

    async fn handle_user_message(
        &mut self,
        event: Event,
        subject_id: String,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.life.force_active(now) {
            ForceOutcome::Held => {
                let until = now + Duration::seconds(self.config.engine.dream_hold_secs);
                debug!(event_id = %event.id, %until, "dreaming; message held");
                self.queue.enqueue_after(event, until);
                return Ok(());
            }
            ForceOutcome::Transitioned(transition) => {
                self.emit(EngineOutput::StateChanged(transition));
                self.save_life()?;
            }
            ForceOutcome::AlreadyActive => self.save_life()?,
        }

        let progress = self.in_flight.get(&event.id).copied().unwrap_or_default();
        let timeout = self.config.generation_timeout();
        let interaction = Interaction::new(subject_id.clone(), text.clone(), event.created_at);

        if let Some(classifier) = self.collaborators.resolution.clone() {
            let resolved = self
                .tracker
                .detect_resolutions(&interaction, classifier.as_ref(), timeout)
                .await?;
            for concern_id in resolved {
                self.emit(EngineOutput::ConcernResolved {
                    concern_id,
                    subject_id: subject_id.clone(),
                });
            }
        }

        if progress.classified {
            debug!(event_id = %event.id, "follow-up classification already applied");
        } else if let Some(classifier) = self.collaborators.follow_up.clone() {
            let candidate = self
                .config
                .retry
                .run("follow-up classifier", || {
                    call_with_timeout(
                        timeout,
                        "follow-up classifier",
                        classifier.classify_for_followup(&interaction),
                    )
                })
                .await;
            match candidate {
                Ok(Some(candidate)) => {
                    let concern = self.tracker.track(&subject_id, &candidate, now)?;
                    self.emit(EngineOutput::ConcernTracked {
                        concern_id: concern.concern_id,
                        subject_id: subject_id.clone(),
                        topic: concern.topic,
                        next_check_at: concern.next_check_at,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(%subject_id, "follow-up classification failed: {e}"),
            }
            self.in_flight.entry(event.id).or_default().classified = true;
        }

        let generated = match self.collaborators.completion.clone() {
            Some(service) => {
                if !progress.charged {
                    self.budget.record_unthrottled();
                    self.in_flight.entry(event.id).or_default().charged = true;
                }
                self.save_budget()?;
                let context = GenerationContext {
                    purpose: GenerationPurpose::Reply,
                    subject_id: Some(subject_id.clone()),
                    input: text,
                    life_state: self.life.state(),
                    concern: None,
                };
                match self.generate(service.as_ref(), &context).await {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        warn!(event_id = %event.id, "reply generation failed: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let (text, generated) = match generated {
            Some(reply) => (reply, true),
            None => (reply_template(), false),
        };
        self.emit(EngineOutput::Reply {
            event_id: event.id,
            subject_id,
            text,
            generated,
        });
        Ok(())
    }

    async fn handle_concern_due(
        &mut self,
        event_id: Uuid,
        concern_id: &str,
        topic: Topic,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let life = self.life.state();
        if approval_policy(EventKind::ConcernDue, life, Some(topic)) == Approval::Suppressed {
            info!(%event_id, concern_id, %topic, "concern check suppressed while sleeping");
            self.emit(EngineOutput::Suppressed {
                event_id,
                kind: EventKind::ConcernDue,
                reason: format!("{topic} concern while {life}"),
            });
            return Ok(());
        }

        match self.tracker.get(concern_id)? {
            Some(concern) if concern.is_active() => self.process_follow_up(concern, now).await,
            Some(concern) => {
                debug!(concern_id, status = %concern.status, "concern no longer active");
                Ok(())
            }
            None => {
                warn!(concern_id, "concern check for unknown concern");
                Ok(())
            }
        }
    }

    async fn handle_activity(
        &mut self,
        event_id: Uuid,
        kind: EventKind,
        activity: Activity,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut generated = None;
        if !self.permits(activity, now) {
            debug!(%event_id, ?activity, "routine does not permit activity; light path");
        } else if let Some(service) = self.collaborators.completion.clone() {
            if self.budget.try_consume() {
                self.save_budget()?;
                let context = GenerationContext {
                    purpose: GenerationPurpose::Activity,
                    subject_id: None,
                    input: activity_brief(kind, subject),
                    life_state: self.life.state(),
                    concern: None,
                };
                match self.generate(service.as_ref(), &context).await {
                    Ok(text) => generated = Some(text),
                    Err(e) => warn!(%event_id, %kind, "activity generation failed: {e}"),
                }
            }
        }

        let (text, generated) = match generated {
            Some(text) => (text, true),
            None => (activity_template(kind, subject), false),
        };
        self.emit(EngineOutput::Activity {
            event_id,
            kind,
            text,
            generated,
        });
        Ok(())
    }

    /// Timing, composition, dispatch and backoff for one due concern.
    pub(super) async fn process_follow_up(
        &mut self,
        mut concern: Concern,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let jitter = self.timing.random_jitter(&mut self.rng);
        let decision = self.timing.decide(&TimingContext {
            now,
            urgency: concern.urgency,
            status: concern.status,
            dispatched_last_hour: self.pacing.count(&concern.subject_id, now),
            jitter,
        });

        match decision.action {
            TimingAction::Suppress => return Ok(()),
            TimingAction::Defer => {
                let until = decision.scheduled_for.unwrap_or_else(|| {
                    now + Duration::seconds(self.config.pacing.pacing_gap_secs)
                });
                self.tracker
                    .reschedule(&mut concern, until, now, &decision.reason.to_string())?;
                self.emit(EngineOutput::FollowUpDeferred {
                    concern_id: concern.concern_id.clone(),
                    until: concern.next_check_at.unwrap_or(until),
                    reason: decision.reason,
                });
                return Ok(());
            }
            TimingAction::SendNow => {}
        }

        let Some((text, generated)) = self.compose_follow_up(&concern, now).await? else {
            return self.push_forward(&mut concern, now, "composition failed");
        };

        let message = OutboundMessage {
            subject_id: concern.subject_id.clone(),
            text: text.clone(),
            concern_id: Some(concern.concern_id.clone()),
        };
        let report = self.dispatcher.dispatch(&message, now).await;
        for record in &report.outcomes {
            self.store
                .record_delivery(&self.config.engine.agent_id, record)?;
        }
        if !report.delivered() {
            return self.push_forward(&mut concern, now, "no channel accepted the message");
        }

        self.pacing.record(&concern.subject_id, now);
        let progress = self
            .tracker
            .record_follow_up(&mut concern, report.message_ref(), now)?;
        self.emit(EngineOutput::FollowUpSent {
            concern_id: concern.concern_id,
            subject_id: concern.subject_id,
            text,
            generated,
            follow_up_count: concern.follow_up_count,
            abandoned: progress == FollowUpProgress::Abandoned,
        });
        Ok(())
    }

    /// Text for a follow-up that timing cleared.
    ///
    /// `None` means generation failed for a non-critical concern and the
    /// check should be retried later.
    async fn compose_follow_up(
        &mut self,
        concern: &Concern,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, bool)>> {
        let template = Some((concern.template_message(), false));

        if self.life.state() == LifeState::Sleeping && concern.topic != Topic::Dream {
            debug!(concern_id = %concern.concern_id, "sleeping; template follow-up");
            return Ok(template);
        }
        if !self.permits(Activity::FollowUp, now) {
            debug!(concern_id = %concern.concern_id, "routine does not permit follow-ups; template");
            return Ok(template);
        }
        let Some(service) = self.collaborators.completion.clone() else {
            return Ok(template);
        };
        if !self.budget.try_consume() {
            return Ok(template);
        }
        self.save_budget()?;

        let context = GenerationContext {
            purpose: GenerationPurpose::FollowUp,
            subject_id: Some(concern.subject_id.clone()),
            input: concern.generation_brief(),
            life_state: self.life.state(),
            concern: Some(concern.clone()),
        };
        match self.generate(service.as_ref(), &context).await {
            Ok(text) => Ok(Some((text, true))),
            Err(e) if concern.urgency == Urgency::Critical => {
                warn!(concern_id = %concern.concern_id, "generation failed; sending template: {e}");
                Ok(template)
            }
            Err(e) => {
                warn!(concern_id = %concern.concern_id, "generation failed: {e}");
                Ok(None)
            }
        }
    }

    /// Retry the check after `failure_retry_secs` without counting it.
    fn push_forward(&mut self, concern: &mut Concern, now: DateTime<Utc>, reason: &str) -> Result<()> {
        let until = now + Duration::seconds(self.config.concerns.failure_retry_secs);
        self.tracker.reschedule(concern, until, now, reason)?;
        self.emit(EngineOutput::FollowUpRescheduled {
            concern_id: concern.concern_id.clone(),
            until: concern.next_check_at.unwrap_or(until),
            reason: reason.to_owned(),
        });
        Ok(())
    }

    async fn generate(
        &self,
        service: &dyn CompletionService,
        context: &GenerationContext,
    ) -> Result<String> {
        let timeout = self.config.generation_timeout();
        let text = self
            .config
            .retry
            .run("completion", || {
                call_with_timeout(timeout, "completion", service.generate(context))
            })
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::TransientExternal(
                "completion returned empty text".to_owned(),
            ));
        }
        Ok(text.to_owned())
    }
}

fn reply_template() -> String {
    "Got your message. I can't give you a full answer right now, but I'll pick this up soon."
        .to_owned()
}

fn activity_template(kind: EventKind, subject: &str) -> String {
    match kind {
        EventKind::ScheduledTask => format!("Scheduled task noted: {subject}"),
        EventKind::GoalCheckpoint => format!("Checkpoint reached for goal: {subject}"),
        EventKind::RoutineTransition => format!("Now in routine: {subject}"),
        _ => subject.to_owned(),
    }
}

fn activity_brief(kind: EventKind, subject: &str) -> String {
    match kind {
        EventKind::ScheduledTask => format!("Carry out this scheduled task and report briefly: {subject}"),
        EventKind::GoalCheckpoint => {
            format!("Review progress on the goal \"{subject}\" and note the next step.")
        }
        EventKind::RoutineTransition => {
            format!("The day has moved into the \"{subject}\" routine. Reflect briefly on what matters now.")
        }
        _ => subject.to_owned(),
    }
}
