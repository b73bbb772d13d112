//! SQLite-backed [`StateStore`].
//!
//! A single database file holds every agent's state, keyed by owner id.
//! Thread-safe via an internal `Mutex<Connection>`; writes that touch more
//! than one row run inside a transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::{apply_schema, read_schema_version};
use super::{ConcernAuditEntry, DeliveryRecord, StateStore};
use crate::budget::BudgetState;
use crate::concern::{Concern, ConcernStatus, Topic, Urgency};
use crate::error::{EngineError, Result};
use crate::life::LifeSnapshot;

/// Errors raised inside the SQLite backend.
#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("concern not found: {0}")]
    NotFound(String),
    #[error("store lock poisoned")]
    Lock,
}

impl From<SqliteStoreError> for EngineError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::NotFound(id) => EngineError::NotFound(format!("concern {id}")),
            other => EngineError::Persistence(other.to_string()),
        }
    }
}

const CONCERN_COLUMNS: &str = "concern_id, owner_id, subject_id, topic, subject_text, severity, \
     urgency, status, next_check_at, follow_up_count, max_follow_ups, base_delay_secs, \
     created_at, updated_at, resolved_at, last_message_ref";

/// SQLite implementation of [`StateStore`].
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> std::result::Result<Self, SqliteStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SqliteStoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and ephemeral hosts.
    pub fn open_in_memory() -> std::result::Result<Self, SqliteStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> std::result::Result<Self, SqliteStoreError> {
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> std::result::Result<Option<u32>, SqliteStoreError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> std::result::Result<MutexGuard<'_, Connection>, SqliteStoreError> {
        self.conn.lock().map_err(|_| SqliteStoreError::Lock)
    }

    fn query_concerns(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> std::result::Result<Vec<Concern>, SqliteStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_concern)?;
        let mut concerns = Vec::new();
        for r in rows {
            concerns.push(r?);
        }
        Ok(concerns)
    }
}

impl StateStore for SqliteStateStore {
    fn insert_concern(&self, concern: &Concern) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(SqliteStoreError::from)?;
        tx.execute(
            &format!(
                "INSERT INTO concerns ({CONCERN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                concern.concern_id,
                concern.owner_id,
                concern.subject_id,
                concern.topic.as_str(),
                concern.subject_text,
                f64::from(concern.severity),
                concern.urgency.as_str(),
                concern.status.as_str(),
                concern.next_check_at.map(|t| t.timestamp_millis()),
                concern.follow_up_count,
                concern.max_follow_ups,
                concern.base_delay_secs,
                concern.created_at.timestamp_millis(),
                concern.updated_at.timestamp_millis(),
                concern.resolved_at.map(|t| t.timestamp_millis()),
                concern.last_message_ref,
            ],
        )
        .map_err(SqliteStoreError::from)?;
        insert_audit(&tx, concern, "created")?;
        tx.commit().map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn update_concern(&self, concern: &Concern, note: &str) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(SqliteStoreError::from)?;
        let rows = tx
            .execute(
                "UPDATE concerns SET subject_text = ?2, severity = ?3, urgency = ?4, status = ?5, \
                 next_check_at = ?6, follow_up_count = ?7, max_follow_ups = ?8, \
                 base_delay_secs = ?9, updated_at = ?10, resolved_at = ?11, \
                 last_message_ref = ?12 WHERE concern_id = ?1",
                params![
                    concern.concern_id,
                    concern.subject_text,
                    f64::from(concern.severity),
                    concern.urgency.as_str(),
                    concern.status.as_str(),
                    concern.next_check_at.map(|t| t.timestamp_millis()),
                    concern.follow_up_count,
                    concern.max_follow_ups,
                    concern.base_delay_secs,
                    concern.updated_at.timestamp_millis(),
                    concern.resolved_at.map(|t| t.timestamp_millis()),
                    concern.last_message_ref,
                ],
            )
            .map_err(SqliteStoreError::from)?;
        if rows == 0 {
            return Err(SqliteStoreError::NotFound(concern.concern_id.clone()).into());
        }
        insert_audit(&tx, concern, note)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn get_concern(&self, concern_id: &str) -> Result<Option<Concern>> {
        let conn = self.lock()?;
        let concern = conn
            .query_row(
                &format!("SELECT {CONCERN_COLUMNS} FROM concerns WHERE concern_id = ?1"),
                params![concern_id],
                row_to_concern,
            )
            .optional()
            .map_err(SqliteStoreError::from)?;
        Ok(concern)
    }

    fn active_concerns_for_subject(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> Result<Vec<Concern>> {
        Ok(self.query_concerns(
            &format!(
                "SELECT {CONCERN_COLUMNS} FROM concerns \
                 WHERE owner_id = ?1 AND subject_id = ?2 AND status = 'active' \
                 ORDER BY created_at ASC"
            ),
            params![owner_id, subject_id],
        )?)
    }

    fn due_concerns(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Vec<Concern>> {
        Ok(self.query_concerns(
            &format!(
                "SELECT {CONCERN_COLUMNS} FROM concerns \
                 WHERE owner_id = ?1 AND status = 'active' \
                 AND next_check_at IS NOT NULL AND next_check_at <= ?2 \
                 ORDER BY next_check_at ASC, created_at ASC"
            ),
            params![owner_id, now.timestamp_millis()],
        )?)
    }

    fn delete_concern(&self, concern_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(SqliteStoreError::from)?;
        tx.execute(
            "INSERT INTO concern_audit (concern_id, status, follow_up_count, note, at) \
             SELECT concern_id, status, follow_up_count, 'deleted', ?2 \
             FROM concerns WHERE concern_id = ?1",
            params![concern_id, Utc::now().timestamp_millis()],
        )
        .map_err(SqliteStoreError::from)?;
        let rows = tx
            .execute(
                "DELETE FROM concerns WHERE concern_id = ?1",
                params![concern_id],
            )
            .map_err(SqliteStoreError::from)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        Ok(rows > 0)
    }

    fn sweep_closed_concerns(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = before.timestamp_millis();
        let tx = conn.unchecked_transaction().map_err(SqliteStoreError::from)?;
        tx.execute(
            "DELETE FROM concern_audit WHERE concern_id IN ( \
                SELECT concern_id FROM concerns WHERE owner_id = ?1 \
                AND status IN ('resolved', 'abandoned') \
                AND COALESCE(resolved_at, updated_at) < ?2)",
            params![owner_id, cutoff],
        )
        .map_err(SqliteStoreError::from)?;
        let removed = tx
            .execute(
                "DELETE FROM concerns WHERE owner_id = ?1 \
                 AND status IN ('resolved', 'abandoned') \
                 AND COALESCE(resolved_at, updated_at) < ?2",
                params![owner_id, cutoff],
            )
            .map_err(SqliteStoreError::from)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        Ok(removed)
    }

    fn concern_audit(&self, concern_id: &str) -> Result<Vec<ConcernAuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT concern_id, status, follow_up_count, note, at FROM concern_audit \
                 WHERE concern_id = ?1 ORDER BY id ASC",
            )
            .map_err(SqliteStoreError::from)?;
        let rows = stmt
            .query_map(params![concern_id], |row| {
                let status: String = row.get(1)?;
                Ok(ConcernAuditEntry {
                    concern_id: row.get(0)?,
                    status: parse_column(1, &status, ConcernStatus::parse)?,
                    follow_up_count: row.get(2)?,
                    note: row.get(3)?,
                    at: millis_column(row, 4)?,
                })
            })
            .map_err(SqliteStoreError::from)?;
        let mut entries = Vec::new();
        for r in rows {
            entries.push(r.map_err(SqliteStoreError::from)?);
        }
        Ok(entries)
    }

    fn load_budget(&self, owner_id: &str) -> Result<Option<BudgetState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT date, calls_used, daily_quota FROM budget_days \
                 WHERE owner_id = ?1 ORDER BY date DESC LIMIT 1",
                params![owner_id],
                |row| {
                    let date: String = row.get(0)?;
                    Ok(BudgetState {
                        date: parse_column(0, &date, |s| {
                            NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
                        })?,
                        calls_used: row.get(1)?,
                        daily_quota: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(SqliteStoreError::from)?;
        Ok(state)
    }

    fn save_budget(&self, owner_id: &str, state: &BudgetState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO budget_days (owner_id, date, calls_used, daily_quota) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(owner_id, date) DO UPDATE SET \
             calls_used = excluded.calls_used, daily_quota = excluded.daily_quota",
            params![
                owner_id,
                state.date.format("%Y-%m-%d").to_string(),
                state.calls_used,
                state.daily_quota
            ],
        )
        .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn load_life_snapshot(&self, owner_id: &str) -> Result<Option<LifeSnapshot>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM life_snapshot WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(SqliteStoreError::from)?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(SqliteStoreError::from)?,
            )),
            None => Ok(None),
        }
    }

    fn save_life_snapshot(&self, owner_id: &str, snapshot: &LifeSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).map_err(SqliteStoreError::from)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO life_snapshot (owner_id, snapshot, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(owner_id) DO UPDATE SET \
             snapshot = excluded.snapshot, updated_at = excluded.updated_at",
            params![owner_id, json, Utc::now().timestamp_millis()],
        )
        .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn record_delivery(&self, owner_id: &str, record: &DeliveryRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO deliveries \
             (owner_id, subject_id, channel_id, concern_id, delivered, detail, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                owner_id,
                record.subject_id,
                record.channel_id,
                record.concern_id,
                record.delivered,
                record.detail,
                record.at.timestamp_millis()
            ],
        )
        .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn deliveries_since(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT subject_id, channel_id, concern_id, delivered, detail, at \
                 FROM deliveries WHERE owner_id = ?1 AND at >= ?2 ORDER BY at ASC, id ASC",
            )
            .map_err(SqliteStoreError::from)?;
        let rows = stmt
            .query_map(params![owner_id, since.timestamp_millis()], |row| {
                Ok(DeliveryRecord {
                    subject_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    concern_id: row.get(2)?,
                    delivered: row.get(3)?,
                    detail: row.get(4)?,
                    at: millis_column(row, 5)?,
                })
            })
            .map_err(SqliteStoreError::from)?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r.map_err(SqliteStoreError::from)?);
        }
        Ok(records)
    }

    fn prune_deliveries(&self, owner_id: &str, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM deliveries WHERE owner_id = ?1 AND at < ?2",
                params![owner_id, before.timestamp_millis()],
            )
            .map_err(SqliteStoreError::from)?;
        Ok(removed)
    }
}

fn insert_audit(
    conn: &Connection,
    concern: &Concern,
    note: &str,
) -> std::result::Result<(), SqliteStoreError> {
    conn.execute(
        "INSERT INTO concern_audit (concern_id, status, follow_up_count, note, at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            concern.concern_id,
            concern.status.as_str(),
            concern.follow_up_count,
            note,
            concern.updated_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn conversion_error(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn parse_column<T>(idx: usize, raw: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| conversion_error(idx, Type::Text, format!("unrecognised value {raw:?}")))
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {ms} out of range")))
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

fn optional_millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_millis(idx, ms))
        .transpose()
}

fn row_to_concern(row: &Row<'_>) -> rusqlite::Result<Concern> {
    let topic: String = row.get(3)?;
    let urgency: String = row.get(6)?;
    let status: String = row.get(7)?;
    let severity: f64 = row.get(5)?;
    Ok(Concern {
        concern_id: row.get(0)?,
        owner_id: row.get(1)?,
        subject_id: row.get(2)?,
        topic: parse_column(3, &topic, Topic::parse)?,
        subject_text: row.get(4)?,
        severity: severity as f32,
        urgency: parse_column(6, &urgency, Urgency::parse)?,
        status: parse_column(7, &status, ConcernStatus::parse)?,
        next_check_at: optional_millis_column(row, 8)?,
        follow_up_count: row.get(9)?,
        max_follow_ups: row.get(10)?,
        base_delay_secs: row.get(11)?,
        created_at: millis_column(row, 12)?,
        updated_at: millis_column(row, 13)?,
        resolved_at: optional_millis_column(row, 14)?,
        last_message_ref: row.get(15)?,
    })
}
