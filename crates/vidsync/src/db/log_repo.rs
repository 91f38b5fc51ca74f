//! Job log repository: append-only rows in `job_logs`.
//!
//! `seq` is 0-based and dense per job at append time. The log "length" is
//! `MAX(seq) + 1`, so a viewer cursor stays valid after retention removes the
//! oldest rows.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw log row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub job_id: String,
    pub seq: u64,
    pub time: String,
    pub level: String,
    pub message: String,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    /// Arbitrary structured payload as JSON text.
    pub data: Option<String>,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            seq: row.get("seq")?,
            time: row.get("time")?,
            level: row.get("level")?,
            message: row.get("message")?,
            channel_id: row.get("channel_id")?,
            channel_name: row.get("channel_name")?,
            data: row.get("data")?,
        })
    }
}

/// Appends an entry at the end of the job's log and returns its `seq`.
/// The `seq` field of `entry` is ignored.
pub fn append(db: &Database, entry: &LogRow) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let seq: u64 = conn.query_row(
            "INSERT INTO job_logs (job_id, seq, time, level, message, channel_id, channel_name, data)
             VALUES (?1,
                     (SELECT COALESCE(MAX(seq) + 1, 0) FROM job_logs WHERE job_id = ?1),
                     ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING seq",
            params![
                entry.job_id,
                entry.time,
                entry.level,
                entry.message,
                entry.channel_id,
                entry.channel_name,
                entry.data,
            ],
            |r| r.get(0),
        )?;
        Ok(seq)
    })
}

/// Number of entries ever appended to the job's log.
pub fn length(db: &Database, job_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let len: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM job_logs WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(len)
    })
}

/// Returns entries with `seq >= from`, in order.
pub fn since(db: &Database, job_id: &str, from: u64) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_logs WHERE job_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, from], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns entries with `from <= seq < to`, in order.
pub fn range(
    db: &Database,
    job_id: &str,
    from: u64,
    to: u64,
) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_logs WHERE job_id = ?1 AND seq >= ?2 AND seq < ?3 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, from, to], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns the last `limit` entries, in order.
pub fn tail(db: &Database, job_id: &str, limit: u64) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                 SELECT * FROM job_logs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, limit], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes the oldest entries so at most `keep_last` remain. Returns the
/// number of rows removed. The newest entry is always kept so `seq`
/// numbering never restarts.
pub fn prune(db: &Database, job_id: &str, keep_last: u64) -> Result<usize, DatabaseError> {
    let keep_last = keep_last.max(1);
    db.with_conn(|conn| {
        let removed = conn.execute(
            "DELETE FROM job_logs WHERE job_id = ?1 AND seq <
                 (SELECT COALESCE(MAX(seq) + 1, 0) FROM job_logs WHERE job_id = ?1) - ?2",
            params![job_id, keep_last],
        )?;
        Ok(removed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::{self, JobRow};

    fn test_db_with_job(id: &str) -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        job_repo::insert(
            &db,
            &JobRow {
                id: id.to_string(),
                job_type: "full_sync".to_string(),
                target_id: None,
                incremental: false,
                status: "running".to_string(),
                transitioning: false,
                progress: "{}".to_string(),
                error_message: None,
                created_at: "2026-01-01T00:00:00.000000Z".to_string(),
                updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
                started_at: None,
                finished_at: None,
                deleted_at: None,
            },
        )
        .unwrap();
        db
    }

    fn entry(job_id: &str, message: &str) -> LogRow {
        LogRow {
            job_id: job_id.to_string(),
            seq: 0,
            time: "2026-01-01T00:00:01.000000Z".to_string(),
            level: "info".to_string(),
            message: message.to_string(),
            channel_id: None,
            channel_name: None,
            data: None,
        }
    }

    #[test]
    fn test_append_assigns_dense_sequence() {
        let db = test_db_with_job("j1");
        assert_eq!(append(&db, &entry("j1", "a")).unwrap(), 0);
        assert_eq!(append(&db, &entry("j1", "b")).unwrap(), 1);
        assert_eq!(append(&db, &entry("j1", "c")).unwrap(), 2);
        assert_eq!(length(&db, "j1").unwrap(), 3);

        let rows = since(&db, "j1", 1).unwrap();
        let messages: Vec<_> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_append_requires_existing_job() {
        let db = test_db_with_job("j1");
        assert!(append(&db, &entry("missing", "orphan")).is_err());
    }

    #[test]
    fn test_tail_returns_last_entries_in_order() {
        let db = test_db_with_job("j1");
        for i in 0..5 {
            append(&db, &entry("j1", &format!("m{}", i))).unwrap();
        }
        let rows = tail(&db, "j1", 2).unwrap();
        let messages: Vec<_> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["m3", "m4"]);
        assert_eq!(rows[0].seq, 3);
    }

    #[test]
    fn test_prune_keeps_length_stable() {
        let db = test_db_with_job("j1");
        for i in 0..6 {
            append(&db, &entry("j1", &format!("m{}", i))).unwrap();
        }
        assert_eq!(prune(&db, "j1", 2).unwrap(), 4);
        assert_eq!(length(&db, "j1").unwrap(), 6);
        assert_eq!(since(&db, "j1", 0).unwrap().len(), 2);

        // Appends continue after the pruned prefix.
        assert_eq!(append(&db, &entry("j1", "m6")).unwrap(), 6);
    }

    #[test]
    fn test_prune_to_zero_keeps_newest() {
        let db = test_db_with_job("j1");
        for i in 0..3 {
            append(&db, &entry("j1", &format!("m{}", i))).unwrap();
        }
        assert_eq!(prune(&db, "j1", 0).unwrap(), 2);
        assert_eq!(append(&db, &entry("j1", "m3")).unwrap(), 3);
    }

    #[test]
    fn test_range_is_half_open() {
        let db = test_db_with_job("j1");
        for i in 0..5 {
            append(&db, &entry("j1", &format!("m{}", i))).unwrap();
        }
        let rows = range(&db, "j1", 1, 3).unwrap();
        let messages: Vec<_> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["m1", "m2"]);
        assert!(range(&db, "j1", 5, 9).unwrap().is_empty());
    }

    #[test]
    fn test_empty_log() {
        let db = test_db_with_job("j1");
        assert_eq!(length(&db, "j1").unwrap(), 0);
        assert!(tail(&db, "j1", 200).unwrap().is_empty());
        assert_eq!(prune(&db, "j1", 10).unwrap(), 0);
    }
}
