//! Event log repository: fingerprinted, deduplicated error/event records.

use rusqlite::{params, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A single event-log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub fingerprint: String,
    pub level: String,
    pub source: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub occurrences: u64,
    pub first_seen: String,
    pub last_seen: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            fingerprint: row.get("fingerprint")?,
            level: row.get("level")?,
            source: row.get("source")?,
            message: row.get("message")?,
            job_id: row.get("job_id")?,
            occurrences: row.get("occurrences")?,
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
        })
    }
}

/// Records one occurrence of an event.
///
/// Uses UPSERT so repeats of the same fingerprint bump `occurrences` and
/// refresh `last_seen`, `message` and `job_id` with the latest values.
pub fn record(
    db: &Database,
    fingerprint: &str,
    level: &str,
    source: &str,
    message: &str,
    job_id: Option<&str>,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO event_log (fingerprint, level, source, message, job_id,
             occurrences, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET
               occurrences = occurrences + 1,
               level = excluded.level,
               message = excluded.message,
               job_id = excluded.job_id,
               last_seen = excluded.last_seen",
            params![fingerprint, level, source, message, job_id, now],
        )?;
        Ok(())
    })
}

/// Returns the most recently seen events, newest first.
pub fn recent(db: &Database, limit: u64) -> Result<Vec<EventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM event_log ORDER BY last_seen DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes events last seen before `cutoff`. Returns the number removed.
pub fn prune_before(db: &Database, cutoff: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let removed = conn.execute(
            "DELETE FROM event_log WHERE last_seen < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    })
}
