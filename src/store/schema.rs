//! SQLite DDL for the engine state store.
//!
//! Timestamps are stored as epoch milliseconds.

use rusqlite::Connection;

use super::CURRENT_SCHEMA_VERSION;

/// Complete DDL. Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS concerns (
    concern_id       TEXT PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    subject_id       TEXT NOT NULL,
    topic            TEXT NOT NULL,
    subject_text     TEXT NOT NULL,
    severity         REAL NOT NULL DEFAULT 0.5,
    urgency          TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'active',
    next_check_at    INTEGER,            -- NULL once closed
    follow_up_count  INTEGER NOT NULL DEFAULT 0,
    max_follow_ups   INTEGER NOT NULL,
    base_delay_secs  INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    resolved_at      INTEGER,
    last_message_ref TEXT
);

-- Serves the per-tick "due" query.
CREATE INDEX IF NOT EXISTS idx_concerns_due
    ON concerns(owner_id, status, next_check_at);
CREATE INDEX IF NOT EXISTS idx_concerns_subject
    ON concerns(owner_id, subject_id, status);

CREATE TABLE IF NOT EXISTS concern_audit (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    concern_id      TEXT NOT NULL,
    status          TEXT NOT NULL,
    follow_up_count INTEGER NOT NULL,
    note            TEXT NOT NULL,
    at              INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_concern_audit_concern ON concern_audit(concern_id);

CREATE TABLE IF NOT EXISTS budget_days (
    owner_id    TEXT NOT NULL,
    date        TEXT NOT NULL,           -- YYYY-MM-DD, local calendar date
    calls_used  INTEGER NOT NULL,
    daily_quota INTEGER NOT NULL,
    PRIMARY KEY (owner_id, date)
);

CREATE TABLE IF NOT EXISTS life_snapshot (
    owner_id   TEXT PRIMARY KEY,
    snapshot   TEXT NOT NULL,            -- JSON LifeSnapshot
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS deliveries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id    TEXT NOT NULL,
    subject_id  TEXT NOT NULL,
    channel_id  TEXT NOT NULL,
    concern_id  TEXT,
    delivered   INTEGER NOT NULL,
    detail      TEXT,
    at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deliveries_at ON deliveries(owner_id, at);
"#;

/// Apply the full schema and seed the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the schema version. `None` if missing or unparsable.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
