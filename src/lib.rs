//! Cadence: autonomous scheduling and concern-lifecycle engine.
//!
//! Decides when an always-on assistant acts on its own: which life state it
//! is in, which events to handle and in what order, how much text
//! generation it may spend today, which user concerns deserve a follow-up,
//! and when those follow-ups go out.
//!
//! # Architecture
//!
//! One scheduling loop per agent owns all mutable state and ticks on a
//! fixed interval:
//! - **Queue**: priority-ordered events with backpressure eviction
//! - **Life state**: routine-driven state machine with a dream sub-mode
//! - **Budget**: daily generation quota, reset on the local date
//! - **Concerns**: persisted follow-ups with exponential backoff and
//!   resolution detection
//! - **Timing**: quiet hours, urgency bypass and per-subject rate limits
//! - **Dispatch**: fan-out to delivery channels with retry and an audit log
//!
//! State lives in SQLite, so a restarted loop resumes where it stopped.

pub mod budget;
pub mod clock;
pub mod collaborators;
pub mod concern;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod life;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod routine;
pub mod scheduler;
pub mod store;
pub mod timing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use life::LifeState;
pub use queue::{Event, EventKind, EventPayload, EventSource};
pub use scheduler::{Collaborators, EngineHandle, EngineOutput, EngineSnapshot, SchedulingLoop};
pub use store::{SqliteStateStore, StateStore};
