//! The scheduling loop and its public surface.
//!
//! - **Runner** (`runner.rs`): `SchedulingLoop`: startup restore, the tick
//!   loop, routine evaluation, due-concern sweep, shutdown
//! - **Handling** (`handling.rs`): per-event light/heavy paths and the
//!   follow-up pipeline (timing → composition → dispatch → backoff)
//!
//! The loop is the single writer of life state, budget and concerns. Other
//! tasks hold an [`EngineHandle`]: they enqueue events and read snapshots.

pub mod handling;
pub mod runner;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::collaborators::{CompletionService, FollowUpClassifier, ResolutionClassifier};
use crate::concern::Topic;
use crate::life::{DreamChange, LifeState, Transition};
use crate::queue::{Event, EventKind, EventPayload, EventQueue, EventSource};
use crate::timing::TimingReason;

pub use runner::SchedulingLoop;

/// External services wired into the loop. Any may be absent; without a
/// completion service every path is the light (template) path.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub completion: Option<Arc<dyn CompletionService>>,
    pub follow_up: Option<Arc<dyn FollowUpClassifier>>,
    pub resolution: Option<Arc<dyn ResolutionClassifier>>,
}

impl Collaborators {
    #[must_use]
    pub fn with_completion(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(service);
        self
    }

    #[must_use]
    pub fn with_follow_up_classifier(mut self, classifier: Arc<dyn FollowUpClassifier>) -> Self {
        self.follow_up = Some(classifier);
        self
    }

    #[must_use]
    pub fn with_resolution_classifier(mut self, classifier: Arc<dyn ResolutionClassifier>) -> Self {
        self.resolution = Some(classifier);
        self
    }
}

/// Something the loop did that the host may want to surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineOutput {
    /// Reply to a user message.
    Reply {
        event_id: Uuid,
        subject_id: String,
        text: String,
        generated: bool,
    },
    /// Result of a scheduled task, goal checkpoint or routine transition.
    Activity {
        event_id: Uuid,
        kind: EventKind,
        text: String,
        generated: bool,
    },
    ConcernTracked {
        concern_id: String,
        subject_id: String,
        topic: Topic,
        next_check_at: Option<DateTime<Utc>>,
    },
    ConcernResolved {
        concern_id: String,
        subject_id: String,
    },
    FollowUpSent {
        concern_id: String,
        subject_id: String,
        text: String,
        generated: bool,
        follow_up_count: u32,
        abandoned: bool,
    },
    FollowUpDeferred {
        concern_id: String,
        until: DateTime<Utc>,
        reason: TimingReason,
    },
    /// Composition or delivery failed; the check was pushed forward.
    FollowUpRescheduled {
        concern_id: String,
        until: DateTime<Utc>,
        reason: String,
    },
    /// An event was dropped without handling.
    Suppressed {
        event_id: Uuid,
        kind: EventKind,
        reason: String,
    },
    StateChanged(Transition),
    Dream {
        change: DreamChange,
        at: DateTime<Utc>,
    },
}

/// Read-only view published after every tick and handled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub life_state: LifeState,
    pub dreaming: bool,
    pub routine: Option<String>,
    pub budget_remaining: u32,
    pub calls_used: u32,
    pub queue_len: usize,
    pub evicted_total: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Cloneable handle for producers and observers.
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<EventQueue>,
    clock: Arc<dyn Clock>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    cancel: CancellationToken,
}

impl EngineHandle {
    /// Enqueue an event. Never blocks. Returns an event evicted by
    /// backpressure, if any.
    pub fn submit(&self, event: Event) -> Option<Event> {
        self.queue.enqueue(event)
    }

    /// Enqueue a user message stamped with the engine clock.
    pub fn user_message(&self, subject_id: impl Into<String>, text: impl Into<String>) -> Uuid {
        let event = Event::user_message(subject_id, text, self.clock.now());
        let id = event.id;
        self.submit(event);
        id
    }

    /// Enqueue a payload from a named external producer.
    pub fn submit_payload(&self, payload: EventPayload, source: EventSource) -> Uuid {
        let event = Event::new(payload, source, self.clock.now());
        let id = event.id;
        self.submit(event);
        id
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that wakes on every new snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Ask the loop to stop after the current item.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
