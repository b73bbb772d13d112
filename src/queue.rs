//! Inbound event queue.
//!
//! Many producers, one consumer. `enqueue` never blocks the caller: when the
//! queue is at capacity the lowest-priority, newest event is evicted and
//! logged as backpressure. Dequeue order is `(priority desc, created_at asc)`
//! with insertion order breaking exact ties.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::concern::Topic;

/// Event type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    ScheduledTask,
    GoalCheckpoint,
    RoutineTransition,
    ConcernDue,
}

impl EventKind {
    /// Priority used when the producer does not set one.
    #[must_use]
    pub fn default_priority(self) -> i32 {
        match self {
            Self::UserMessage => 100,
            Self::ConcernDue => 60,
            Self::GoalCheckpoint => 40,
            Self::ScheduledTask => 30,
            Self::RoutineTransition => 20,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserMessage => write!(f, "user_message"),
            Self::ScheduledTask => write!(f, "scheduled_task"),
            Self::GoalCheckpoint => write!(f, "goal_checkpoint"),
            Self::RoutineTransition => write!(f, "routine_transition"),
            Self::ConcernDue => write!(f, "concern_due"),
        }
    }
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A message from an end user.
    UserMessage { subject_id: String, text: String },
    /// A proactive task registered by the host application.
    ScheduledTask { task: String },
    /// A goal progress checkpoint.
    GoalCheckpoint { goal: String },
    /// The routine table moved the agent into a new window.
    RoutineTransition { routine: String },
    /// Explicit request to evaluate a tracked concern now.
    ConcernDue { concern_id: String, topic: Topic },
}

impl EventPayload {
    /// Discriminant of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserMessage { .. } => EventKind::UserMessage,
            Self::ScheduledTask { .. } => EventKind::ScheduledTask,
            Self::GoalCheckpoint { .. } => EventKind::GoalCheckpoint,
            Self::RoutineTransition { .. } => EventKind::RoutineTransition,
            Self::ConcernDue { .. } => EventKind::ConcernDue,
        }
    }
}

/// Who produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum EventSource {
    /// An end user via some transport.
    User,
    /// The scheduling loop itself.
    Internal,
    /// A named external integration.
    External(String),
}

/// An inbound event. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub payload: EventPayload,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub source: EventSource,
}

impl Event {
    /// Create an event with the kind's default priority.
    pub fn new(payload: EventPayload, source: EventSource, created_at: DateTime<Utc>) -> Self {
        let priority = payload.kind().default_priority();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            created_at,
            source,
        }
    }

    /// Convenience constructor for a user message.
    pub fn user_message(
        subject_id: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventPayload::UserMessage {
                subject_id: subject_id.into(),
                text: text.into(),
            },
            EventSource::User,
            created_at,
        )
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Event type.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Ordering key: highest priority first, then oldest, then first inserted.
type OrderKey = (Reverse<i32>, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueInner {
    ready: BTreeMap<OrderKey, Event>,
    held: Vec<(DateTime<Utc>, u64, Event)>,
    next_seq: u64,
    evicted_total: u64,
}

impl QueueInner {
    fn insert_ready(&mut self, event: Event, seq: u64) {
        self.ready
            .insert((Reverse(event.priority), event.created_at, seq), event);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.held.is_empty() {
            return;
        }
        let mut still_held = Vec::with_capacity(self.held.len());
        for (ready_at, seq, event) in std::mem::take(&mut self.held) {
            if ready_at <= now {
                self.insert_ready(event, seq);
            } else {
                still_held.push((ready_at, seq, event));
            }
        }
        self.held = still_held;
    }

    fn len(&self) -> usize {
        self.ready.len() + self.held.len()
    }

    /// Evict the lowest-priority, newest event, ready or held.
    fn evict_tail(&mut self) -> Option<Event> {
        let ready_tail = self.ready.last_key_value().map(|(key, _)| *key);
        let held_tail = self
            .held
            .iter()
            .enumerate()
            .map(|(i, (_, seq, event))| ((Reverse(event.priority), event.created_at, *seq), i))
            .max_by_key(|(key, _)| *key);

        let event = match (ready_tail, held_tail) {
            (Some(ready), Some((held, index))) if held > ready => self.held.remove(index).2,
            (None, Some((_, index))) => self.held.remove(index).2,
            _ => self.ready.pop_last()?.1,
        };
        self.evicted_total += 1;
        Some(event)
    }
}

/// Thread-safe priority queue of inbound [`Event`]s.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventQueue {
    /// Create a queue bounded at `capacity` events (minimum 1).
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an event. Never blocks.
    ///
    /// Returns the evicted event when the queue was full. The evicted event
    /// may be the one just offered if it ranks lowest.
    pub fn enqueue(&self, event: Event) -> Option<Event> {
        let evicted = {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.insert_ready(event, seq);
            if inner.len() > self.capacity {
                inner.evict_tail()
            } else {
                None
            }
        };

        if let Some(ref dropped) = evicted {
            warn!(
                event_id = %dropped.id,
                kind = %dropped.kind(),
                priority = dropped.priority,
                capacity = self.capacity,
                "event queue full; evicted lowest-priority event"
            );
        }
        self.notify.notify_one();
        evicted
    }

    /// Hold an event until `ready_at`, then make it eligible for dequeue.
    ///
    /// Held events count towards capacity and compete for eviction with
    /// ready ones.
    pub fn enqueue_after(&self, event: Event, ready_at: DateTime<Utc>) -> Option<Event> {
        let evicted = {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            debug!(event_id = %event.id, %ready_at, "holding event");
            inner.held.push((ready_at, seq, event));
            if inner.len() > self.capacity {
                inner.evict_tail()
            } else {
                None
            }
        };
        if let Some(ref dropped) = evicted {
            warn!(
                event_id = %dropped.id,
                kind = %dropped.kind(),
                priority = dropped.priority,
                "event queue full while holding; evicted lowest-priority event"
            );
        }
        evicted
    }

    /// Pop the best ready event without waiting.
    pub fn try_dequeue(&self) -> Option<Event> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.promote_due(now);
        inner.ready.pop_first().map(|(_, event)| event)
    }

    /// Pop the best ready event, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout. Only the scheduling loop calls this.
    pub async fn dequeue_blocking(&self, timeout: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_dequeue() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_dequeue();
            }
        }
    }

    /// Events waiting (ready and held).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events evicted by backpressure since creation.
    #[must_use]
    pub fn evicted_total(&self) -> u64 {
        self.lock().evicted_total
    }
}
