//! Proactive concern tracking.
//!
//! - **Types** (`types.rs`): `Concern`, `Topic`, `Urgency`, `TopicPolicy`
//! - **Tracker** (`tracker.rs`): `ConcernTracker`: creation, due query,
//!   follow-up backoff, resolution detection, retention sweep

pub mod tracker;
pub mod types;

pub use tracker::{ConcernTracker, FollowUpProgress};
pub use types::{
    Concern, ConcernStatus, FollowUpCandidate, Topic, TopicPolicies, TopicPolicy, Urgency,
};
