//! Shared helpers for integration tests.
//!
//! Scripted collaborators, a recording delivery channel, a store wrapper
//! that can be switched into failure, and a tick-driven engine harness.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence::collaborators::{
    CompletionService, FollowUpClassifier, GenerationContext, Interaction, ResolutionClassifier,
    ResolutionVerdict,
};
use cadence::budget::BudgetState;
use cadence::concern::{Concern, FollowUpCandidate, Topic, Urgency};
use cadence::dispatch::{DeliveryAck, DeliveryChannel, NotificationDispatcher, OutboundMessage};
use cadence::life::LifeSnapshot;
use cadence::retry::RetryPolicy;
use cadence::store::{ConcernAuditEntry, DeliveryRecord};
use cadence::{
    Clock, Collaborators, EngineConfig, EngineError, EngineHandle, EngineOutput, ManualClock,
    Result, SchedulingLoop, StateStore,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;

/// 2024-05-`day` `h`:`m` UTC.
pub(crate) fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, h, m, 0).unwrap()
}

/// Default configuration without retry sleeps.
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryPolicy::none();
    config
}

pub(crate) fn candidate(
    topic: Topic,
    text: &str,
    urgency: Urgency,
    delay_secs: i64,
) -> FollowUpCandidate {
    FollowUpCandidate {
        topic,
        subject_text: text.to_owned(),
        severity: 0.6,
        urgency,
        suggested_delay_secs: delay_secs,
    }
}

/// Completion service returning a fixed reply and counting calls.
pub(crate) struct ScriptedCompletion {
    reply: &'static str,
    calls: AtomicU32,
}

impl ScriptedCompletion {
    pub(crate) fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn generate(&self, _context: &GenerationContext) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.to_owned())
    }
}

/// Tracks a follow-up for any message containing `trigger`.
pub(crate) struct TriggerClassifier {
    pub(crate) trigger: &'static str,
    pub(crate) candidate: FollowUpCandidate,
}

#[async_trait]
impl FollowUpClassifier for TriggerClassifier {
    async fn classify_for_followup(
        &self,
        interaction: &Interaction,
    ) -> Result<Option<FollowUpCandidate>> {
        Ok(interaction
            .text
            .contains(self.trigger)
            .then(|| self.candidate.clone()))
    }
}

/// Resolves every concern when a message contains `marker`.
pub(crate) struct MarkerResolution {
    pub(crate) marker: &'static str,
}

#[async_trait]
impl ResolutionClassifier for MarkerResolution {
    async fn check_resolution(
        &self,
        interaction: &Interaction,
        _concern: &Concern,
    ) -> Result<ResolutionVerdict> {
        Ok(ResolutionVerdict {
            resolved: interaction.text.contains(self.marker),
            confidence: 0.95,
        })
    }
}

/// Delivery channel that keeps every message it accepts.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingChannel {
    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_for(&self, concern_id: &str) -> usize {
        self.sent()
            .iter()
            .filter(|m| m.concern_id.as_deref() == Some(concern_id))
            .count()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn id(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, _subject_id: &str, message: &OutboundMessage) -> Result<DeliveryAck> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(DeliveryAck {
            message_ref: Some(format!("rec-{}", sent.len())),
        })
    }
}

/// Delivery channel whose first delivery fails with a broken pipe.
#[derive(Default)]
pub(crate) struct FailOnceChannel {
    calls: AtomicU32,
}

impl FailOnceChannel {
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for FailOnceChannel {
    fn id(&self) -> &str {
        "fail-once"
    }

    async fn deliver(&self, _subject_id: &str, _message: &OutboundMessage) -> Result<DeliveryAck> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pipe closed",
            )));
        }
        Ok(DeliveryAck::default())
    }
}

/// Store wrapper that fails every call while `failing` is set, or only
/// the next few budget saves.
pub(crate) struct FlakyStore {
    inner: Arc<dyn StateStore>,
    failing: AtomicBool,
    budget_save_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            budget_save_failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn fail_budget_saves(&self, count: u32) {
        self.budget_save_failures.store(count, Ordering::SeqCst);
    }

    /// Store calls made so far, failed ones included.
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("database is locked".to_owned()));
        }
        Ok(())
    }
}

impl StateStore for FlakyStore {
    fn insert_concern(&self, concern: &Concern) -> Result<()> {
        self.check()?;
        self.inner.insert_concern(concern)
    }

    fn update_concern(&self, concern: &Concern, note: &str) -> Result<()> {
        self.check()?;
        self.inner.update_concern(concern, note)
    }

    fn get_concern(&self, concern_id: &str) -> Result<Option<Concern>> {
        self.check()?;
        self.inner.get_concern(concern_id)
    }

    fn active_concerns_for_subject(&self, owner_id: &str, subject_id: &str) -> Result<Vec<Concern>> {
        self.check()?;
        self.inner.active_concerns_for_subject(owner_id, subject_id)
    }

    fn due_concerns(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Vec<Concern>> {
        self.check()?;
        self.inner.due_concerns(owner_id, now)
    }

    fn delete_concern(&self, concern_id: &str) -> Result<bool> {
        self.check()?;
        self.inner.delete_concern(concern_id)
    }

    fn sweep_closed_concerns(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        self.inner.sweep_closed_concerns(owner_id, before)
    }

    fn concern_audit(&self, concern_id: &str) -> Result<Vec<ConcernAuditEntry>> {
        self.check()?;
        self.inner.concern_audit(concern_id)
    }

    fn load_budget(&self, owner_id: &str) -> Result<Option<BudgetState>> {
        self.check()?;
        self.inner.load_budget(owner_id)
    }

    fn save_budget(&self, owner_id: &str, state: &BudgetState) -> Result<()> {
        self.check()?;
        let pending = self.budget_save_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.budget_save_failures.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::Persistence("disk I/O error".to_owned()));
        }
        self.inner.save_budget(owner_id, state)
    }

    fn load_life_snapshot(&self, owner_id: &str) -> Result<Option<LifeSnapshot>> {
        self.check()?;
        self.inner.load_life_snapshot(owner_id)
    }

    fn save_life_snapshot(&self, owner_id: &str, snapshot: &LifeSnapshot) -> Result<()> {
        self.check()?;
        self.inner.save_life_snapshot(owner_id, snapshot)
    }

    fn record_delivery(&self, owner_id: &str, record: &DeliveryRecord) -> Result<()> {
        self.check()?;
        self.inner.record_delivery(owner_id, record)
    }

    fn deliveries_since(&self, owner_id: &str, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>> {
        self.check()?;
        self.inner.deliveries_since(owner_id, since)
    }

    fn prune_deliveries(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        self.inner.prune_deliveries(owner_id, before)
    }
}

/// Engine driven tick by tick on a manual clock.
pub(crate) struct TestEngine {
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) engine: SchedulingLoop,
    pub(crate) handle: EngineHandle,
    pub(crate) outputs: mpsc::UnboundedReceiver<EngineOutput>,
    pub(crate) channel: Arc<RecordingChannel>,
}

impl TestEngine {
    pub(crate) fn start(
        start: DateTime<Utc>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Self {
        let dispatcher =
            NotificationDispatcher::new(RetryPolicy::none(), std::time::Duration::from_secs(1));
        Self::start_with_dispatcher(start, store, config, collaborators, dispatcher)
    }

    /// Like [`start`](Self::start), with the recording channel added after
    /// the channels already on `dispatcher`.
    pub(crate) fn start_with_dispatcher(
        start: DateTime<Utc>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
        collaborators: Collaborators,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let channel = Arc::new(RecordingChannel::default());
        let dispatcher = dispatcher.with_channel(channel.clone());
        let (engine, handle, outputs) =
            SchedulingLoop::new(config, store, clock.clone(), collaborators, dispatcher)
                .expect("engine starts");
        Self {
            clock,
            engine: engine.with_rng_seed(7),
            handle,
            outputs,
            channel,
        }
    }

    pub(crate) fn track(&self, subject: &str, c: &FollowUpCandidate) -> Concern {
        self.engine
            .tracker()
            .track(subject, c, self.clock.now())
            .expect("track concern")
    }

    pub(crate) fn drain(&mut self) -> Vec<EngineOutput> {
        let mut out = Vec::new();
        while let Ok(o) = self.outputs.try_recv() {
            out.push(o);
        }
        out
    }

    pub(crate) async fn tick_at(&mut self, when: DateTime<Utc>) -> Vec<EngineOutput> {
        self.clock.set(when);
        self.engine.tick().await.expect("tick");
        self.drain()
    }

    /// Tick every `step` from the current clock up to and including `end`.
    pub(crate) async fn run_until(&mut self, end: DateTime<Utc>, step: Duration) -> Vec<EngineOutput> {
        let mut out = Vec::new();
        let mut now = self.clock.now();
        while now <= end {
            out.extend(self.tick_at(now).await);
            now += step;
        }
        out
    }
}

pub(crate) fn follow_ups_sent(out: &[EngineOutput]) -> Vec<String> {
    out.iter()
        .filter_map(|o| match o {
            EngineOutput::FollowUpSent { concern_id, .. } => Some(concern_id.clone()),
            _ => None,
        })
        .collect()
}
