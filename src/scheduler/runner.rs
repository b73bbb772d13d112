//! Scheduling loop.
//!
//! One tokio task per agent. Each tick re-evaluates the routine table,
//! drains a bounded batch of events, then runs every concern whose
//! `next_check_at` has passed through the follow-up pipeline. Between ticks
//! the loop waits on the queue so user messages are answered promptly.
//!
//! Nothing is scheduled with runtime timers: "due" is recomputed from
//! persisted timestamps every tick, so a restart resumes where it left off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::handling::MessageProgress;
use super::{Collaborators, EngineHandle, EngineOutput, EngineSnapshot};
use crate::budget::BudgetGovernor;
use crate::clock::{Clock, LocalTime};
use crate::concern::ConcernTracker;
use crate::config::EngineConfig;
use crate::dispatch::{NotificationDispatcher, PacingWindow};
use crate::error::{EngineError, Result};
use crate::life::{LifeState, LifeStateMachine, TransitionTrigger};
use crate::queue::{Event, EventPayload, EventQueue, EventSource};
use crate::routine::{Activity, Routine, RoutineTable};
use crate::store::StateStore;
use crate::timing::TimingEngine;

/// Persistence backoff doubles up to `2^MAX_BACKOFF_EXPONENT` tick intervals.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// The single writer of engine state.
pub struct SchedulingLoop {
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) local: LocalTime,
    pub(super) queue: Arc<EventQueue>,
    pub(super) store: Arc<dyn StateStore>,
    pub(super) routines: RoutineTable,
    pub(super) life: LifeStateMachine,
    pub(super) budget: BudgetGovernor,
    pub(super) tracker: ConcernTracker,
    pub(super) timing: TimingEngine,
    pub(super) dispatcher: NotificationDispatcher,
    pub(super) pacing: PacingWindow,
    pub(super) collaborators: Collaborators,
    pub(super) rng: StdRng,
    /// Progress of user messages that hit a persistence failure mid-way.
    pub(super) in_flight: HashMap<Uuid, MessageProgress>,
    /// Consecutive ticks or events aborted by the store.
    pub(super) persistence_failures: u32,
    output_tx: mpsc::UnboundedSender<EngineOutput>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    cancel: CancellationToken,
    last_sweep: Option<NaiveDate>,
    last_tick: Option<DateTime<Utc>>,
}

impl SchedulingLoop {
    /// Validate `config`, restore persisted state and build the loop.
    ///
    /// Returns the loop, a handle for producers and the output stream.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `Persistence` if the store
    /// cannot be read.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        dispatcher: NotificationDispatcher,
    ) -> Result<(Self, EngineHandle, mpsc::UnboundedReceiver<EngineOutput>)> {
        config.validate()?;
        let routines = config.routine_table()?;
        let local = config.local_time();
        let owner = config.engine.agent_id.clone();
        let now = clock.now();

        let life = match store.load_life_snapshot(&owner)? {
            Some(snapshot) => {
                info!(state = %snapshot.current_state, dreaming = snapshot.dream_flag, "restored life state");
                LifeStateMachine::restore(&snapshot, config.life_timings())
            }
            None => {
                let initial = routines
                    .active_at(local.time_of_day(now))
                    .map_or(LifeState::Idle, |r| r.state);
                info!(state = %initial, "starting with fresh life state");
                LifeStateMachine::new(initial, now, config.life_timings())
            }
        };
        store.save_life_snapshot(&owner, &life.snapshot())?;

        let quota = config.budget.daily_quota;
        let budget = match store.load_budget(&owner)? {
            Some(state) => BudgetGovernor::restore(state, quota, Arc::clone(&clock), local),
            None => BudgetGovernor::new(quota, Arc::clone(&clock), local),
        };
        store.save_budget(&owner, &budget.state())?;

        let mut pacing = PacingWindow::default();
        pacing.seed(&store.deliveries_since(&owner, now - pacing.span())?);

        let tracker = ConcernTracker::new(
            Arc::clone(&store),
            owner.clone(),
            config.concerns.topics.clone(),
            config.concerns.resolution_confidence,
        );
        let timing = TimingEngine::new(
            config.quiet_hours(&routines),
            local,
            config.pacing.max_notifications_per_hour,
            Duration::seconds(config.pacing.pacing_gap_secs),
            Duration::seconds(config.pacing.quiet_jitter_max_secs),
        );

        let queue = Arc::new(EventQueue::new(
            config.engine.queue_capacity,
            Arc::clone(&clock),
        ));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut engine = Self {
            config,
            clock: Arc::clone(&clock),
            local,
            queue: Arc::clone(&queue),
            store,
            routines,
            life,
            budget,
            tracker,
            timing,
            dispatcher,
            pacing,
            collaborators,
            rng: StdRng::from_entropy(),
            in_flight: HashMap::new(),
            persistence_failures: 0,
            output_tx,
            snapshot_tx: watch::channel(EngineSnapshot {
                life_state: LifeState::Idle,
                dreaming: false,
                routine: None,
                budget_remaining: 0,
                calls_used: 0,
                queue_len: 0,
                evicted_total: 0,
                last_tick: None,
            })
            .0,
            cancel: cancel.clone(),
            last_sweep: None,
            last_tick: None,
        };
        engine.publish_snapshot(now);

        let handle = EngineHandle {
            queue,
            clock,
            snapshot_rx: engine.snapshot_tx.subscribe(),
            cancel,
        };
        Ok((engine, handle, output_rx))
    }

    /// Use a fixed seed for quiet-hours jitter.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Current life state.
    #[must_use]
    pub fn life_state(&self) -> LifeState {
        self.life.state()
    }

    /// Concern tracker, for inspection.
    #[must_use]
    pub fn tracker(&self) -> &ConcernTracker {
        &self.tracker
    }

    /// Spawn [`run`](Self::run) on the tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Tick until shutdown.
    ///
    /// A persistence failure aborts the current tick and is retried on a
    /// later one; consecutive failures stretch the wait between ticks. Any
    /// other error escaping a tick ends the loop so a supervisor can restart
    /// it from persisted state.
    pub async fn run(mut self) -> Result<()> {
        let period = self.config.tick_interval();
        info!(
            agent_id = %self.config.engine.agent_id,
            tick_secs = period.as_secs(),
            state = %self.life.state(),
            "scheduling loop started"
        );

        while !self.cancel.is_cancelled() {
            match self.tick().await {
                Ok(()) => self.persistence_failures = 0,
                Err(e @ EngineError::Persistence(_)) => {
                    self.persistence_failures += 1;
                    error!(failures = self.persistence_failures, "tick aborted: {e}");
                }
                Err(e) => {
                    error!("scheduling loop failed: {e}");
                    return Err(e);
                }
            }

            let wait = if self.persistence_failures == 0 {
                period
            } else {
                self.persistence_backoff(self.persistence_failures)
            };
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let queue = Arc::clone(&self.queue);
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    event = queue.dequeue_blocking(remaining) => Some(event),
                };
                let Some(next) = next else {
                    break;
                };
                let Some(event) = next else {
                    break;
                };
                let now = self.clock.now();
                match self.handle_contained(event, now).await {
                    Ok(()) => self.publish_snapshot(now),
                    // The event is held; keep waiting out the deadline.
                    Err(e @ EngineError::Persistence(_)) => {
                        self.persistence_failures += 1;
                        error!(failures = self.persistence_failures, "event handling aborted: {e}");
                    }
                    Err(e) => {
                        error!("scheduling loop failed: {e}");
                        return Err(e);
                    }
                }
            }
        }

        info!(agent_id = %self.config.engine.agent_id, "scheduling loop stopped");
        Ok(())
    }

    /// Wait after `failures` consecutive persistence failures: one tick
    /// interval, doubling per failure.
    pub(super) fn persistence_backoff(&self, failures: u32) -> StdDuration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.config.tick_interval() * (1_u32 << exponent)
    }

    /// One scheduler tick.
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.clock.now();
        debug!(%now, queue_len = self.queue.len(), "tick");

        self.apply_routine(now)?;
        self.drain_events(now).await?;
        self.run_due_concerns(now).await?;
        self.maintenance(now)?;

        self.last_tick = Some(now);
        self.publish_snapshot(now);
        Ok(())
    }

    fn current_routine(&self, now: DateTime<Utc>) -> Option<&Routine> {
        self.routines.active_at(self.local.time_of_day(now))
    }

    /// Whether the routine in effect allows `activity`. Gaps in the table
    /// allow everything.
    pub(super) fn permits(&self, activity: Activity, now: DateTime<Utc>) -> bool {
        self.current_routine(now)
            .is_none_or(|routine| routine.permits(activity))
    }

    fn apply_routine(&mut self, now: DateTime<Utc>) -> Result<()> {
        let dream_permitted = self
            .current_routine(now)
            .is_some_and(|routine| routine.permits(Activity::Dream));
        let dream = self.life.advance_dream(now, dream_permitted);
        if let Some(change) = dream {
            self.emit(EngineOutput::Dream { change, at: now });
        }

        let routine = self.current_routine(now).cloned();
        let transition = self.life.evaluate_routine(routine.as_ref(), now);
        if let Some(t) = &transition {
            if let TransitionTrigger::Routine { name } = &t.trigger {
                self.queue.enqueue(Event::new(
                    EventPayload::RoutineTransition {
                        routine: name.clone(),
                    },
                    EventSource::Internal,
                    now,
                ));
            }
            self.emit(EngineOutput::StateChanged(t.clone()));
        }

        if dream.is_some() || transition.is_some() {
            self.save_life()?;
        }
        Ok(())
    }

    async fn drain_events(&mut self, now: DateTime<Utc>) -> Result<()> {
        for _ in 0..self.config.engine.event_batch_size {
            let Some(event) = self.queue.try_dequeue() else {
                break;
            };
            self.handle_contained(event, now).await?;
        }
        Ok(())
    }

    async fn run_due_concerns(&mut self, now: DateTime<Utc>) -> Result<()> {
        for concern in self.tracker.due(now)? {
            let concern_id = concern.concern_id.clone();
            match self.process_follow_up(concern, now).await {
                Ok(()) => {}
                Err(e @ EngineError::Persistence(_)) => return Err(e),
                Err(e) => error!(%concern_id, "follow-up failed: {e}"),
            }
        }
        Ok(())
    }

    /// Once per local day: retention sweep of closed concerns and the
    /// delivery log.
    fn maintenance(&mut self, now: DateTime<Utc>) -> Result<()> {
        let today = self.local.date(now);
        if self.last_sweep == Some(today) {
            return Ok(());
        }
        let retention = Duration::days(self.config.concerns.retention_days);
        self.tracker.sweep(now, retention)?;
        let pruned = self
            .store
            .prune_deliveries(&self.config.engine.agent_id, now - retention)?;
        if pruned > 0 {
            debug!(pruned, "delivery log pruned");
        }
        self.last_sweep = Some(today);
        Ok(())
    }

    pub(super) fn save_life(&self) -> Result<()> {
        self.store
            .save_life_snapshot(&self.config.engine.agent_id, &self.life.snapshot())
    }

    pub(super) fn save_budget(&self) -> Result<()> {
        self.store
            .save_budget(&self.config.engine.agent_id, &self.budget.state())
    }

    pub(super) fn emit(&self, output: EngineOutput) {
        if self.output_tx.send(output).is_err() {
            debug!("engine output receiver dropped");
        }
    }

    fn publish_snapshot(&self, now: DateTime<Utc>) {
        let budget = self.budget.state();
        let snapshot = EngineSnapshot {
            life_state: self.life.state(),
            dreaming: self.life.is_dreaming(),
            routine: self.current_routine(now).map(|r| r.name.clone()),
            budget_remaining: budget.remaining(),
            calls_used: budget.calls_used,
            queue_len: self.queue.len(),
            evicted_total: self.queue.evicted_total(),
            last_tick: self.last_tick,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
