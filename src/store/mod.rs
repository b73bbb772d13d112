//! Persistence for concerns, budget days, the life-state snapshot and the
//! delivery log.
//!
//! - **Schema** (`schema.rs`): DDL and schema versioning
//! - **SQLite** (`sqlite.rs`): `SqliteStateStore`, the bundled backend
//!
//! Everything is keyed by agent (owner) id. The scheduling loop is the only
//! writer; request handlers never reach the store directly.

pub mod schema;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetState;
use crate::concern::{Concern, ConcernStatus};
use crate::error::Result;
use crate::life::LifeSnapshot;

pub use sqlite::{SqliteStateStore, SqliteStoreError};

/// Current store schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// One row of a concern's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcernAuditEntry {
    pub concern_id: String,
    /// Status after the change.
    pub status: ConcernStatus,
    pub follow_up_count: u32,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Outcome of one delivery attempt on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subject_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concern_id: Option<String>,
    pub delivered: bool,
    /// Channel message reference on success, failure reason otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable engine state.
///
/// Concern writes that set `next_check_at` are atomic with the record and
/// its audit row.
pub trait StateStore: Send + Sync {
    fn insert_concern(&self, concern: &Concern) -> Result<()>;

    /// Overwrite a concern. Fails with `NotFound` if it does not exist.
    fn update_concern(&self, concern: &Concern, note: &str) -> Result<()>;

    fn get_concern(&self, concern_id: &str) -> Result<Option<Concern>>;

    fn active_concerns_for_subject(&self, owner_id: &str, subject_id: &str)
    -> Result<Vec<Concern>>;

    /// Active concerns with `next_check_at <= now`, oldest first.
    fn due_concerns(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Vec<Concern>>;

    fn delete_concern(&self, concern_id: &str) -> Result<bool>;

    /// Delete closed concerns last touched before `before`. Returns the count.
    fn sweep_closed_concerns(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize>;

    /// Audit trail for one concern, oldest first.
    fn concern_audit(&self, concern_id: &str) -> Result<Vec<ConcernAuditEntry>>;

    /// Most recent budget day.
    fn load_budget(&self, owner_id: &str) -> Result<Option<BudgetState>>;

    fn save_budget(&self, owner_id: &str, state: &BudgetState) -> Result<()>;

    fn load_life_snapshot(&self, owner_id: &str) -> Result<Option<LifeSnapshot>>;

    fn save_life_snapshot(&self, owner_id: &str, snapshot: &LifeSnapshot) -> Result<()>;

    fn record_delivery(&self, owner_id: &str, record: &DeliveryRecord) -> Result<()>;

    /// Deliveries at or after `since`, oldest first.
    fn deliveries_since(&self, owner_id: &str, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>>;

    /// Drop delivery rows older than `before`.
    fn prune_deliveries(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize>;
}
