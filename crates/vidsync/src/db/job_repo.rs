//! Job repository: CRUD and state transitions for the `jobs` table.
//!
//! Every status transition is a single conditional `UPDATE` whose `WHERE`
//! clause encodes the source state, so the affected-row count tells the
//! caller whether the transition was eligible.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub target_id: Option<String>,
    pub incremental: bool,
    pub status: String,
    pub transitioning: bool,
    /// Progress counters as a JSON object.
    pub progress: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            target_id: row.get("target_id")?,
            incremental: row.get("incremental")?,
            status: row.get("status")?,
            transitioning: row.get("transitioning")?,
            progress: row.get("progress")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    /// Substring matched against id, type, target, error and current channel.
    pub search: Option<String>,
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Escapes `%`, `_` and `\` so user input is matched literally by `LIKE`.
fn like_pattern(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len() + 2);
    escaped.push('%');
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, job_type, target_id, incremental, status, transitioning,
             progress, error_message, created_at, updated_at, started_at, finished_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.job_type,
                job.target_id,
                job.incremental,
                job.status,
                job.transitioning,
                job.progress,
                job.error_message,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.finished_at,
                job.deleted_at,
            ],
        )?;
        Ok(())
    })
}

fn find_with_conn(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Finds a job by its ID (deleted or not).
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_with_conn(conn, id))
}

/// Returns only the status column of a job, used by cancellation probes.
pub fn find_status(db: &Database, id: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let status = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status)
    })
}

/// Returns the job currently holding the running slot, deleted or not.
pub fn find_running(db: &Database) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE status = 'running'
                 ORDER BY started_at ASC, rowid ASC LIMIT 1",
                [],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Returns the oldest pending job eligible for execution.
pub fn find_next_pending(db: &Database) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE status = 'pending' AND deleted_at IS NULL
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                [],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Atomically moves the oldest eligible pending job to `running`.
///
/// Returns `None` when another job already holds the running slot or when
/// nothing is pending. `BEGIN IMMEDIATE` takes the write lock up front so the
/// check and the update cannot interleave with another process's claim.
pub fn claim_next_pending(db: &Database, now: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let running: u64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
            [],
            |r| r.get(0),
        )?;
        if running > 0 {
            return Ok(None);
        }

        let next: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE status = 'pending' AND deleted_at IS NULL
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        let Some(id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'running', transitioning = 0, started_at = ?2,
             finished_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        let claimed = find_with_conn(&tx, &id)?;
        tx.commit()?;
        Ok(claimed)
    })
}

/// Queries jobs with filters, returning (rows, total_count), newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if !filter.include_deleted {
            conditions.push("deleted_at IS NULL".to_string());
        }
        if let Some(ref search) = filter.search {
            let n = param_values.len() + 1;
            conditions.push(format!(
                "(id LIKE ?{n} ESCAPE '\\' OR job_type LIKE ?{n} ESCAPE '\\'
                  OR target_id LIKE ?{n} ESCAPE '\\' OR error_message LIKE ?{n} ESCAPE '\\'
                  OR json_extract(progress, '$.currentChannelName') LIKE ?{n} ESCAPE '\\')"
            ));
            param_values.push(Box::new(like_pattern(search)));
        }
        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref job_type) = filter.job_type {
            conditions.push(format!("job_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(job_type.clone()));
        }
        if let Some(ref from_date) = filter.from_date {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from_date.clone()));
        }
        if let Some(ref to_date) = filter.to_date {
            conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to_date.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        // Count total matching rows.
        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        // Fetch paginated results.
        let limit = filter.limit.unwrap_or(50) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts non-deleted jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1 AND deleted_at IS NULL",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Overwrites the progress JSON of a running job.
pub fn update_progress(
    db: &Database,
    id: &str,
    progress: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET progress = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, progress, updated_at],
        )?;
        Ok(n == 1)
    })
}

/// Moves a running job to a terminal status. No-op unless still `running`,
/// which is how an operator's cancellation wins over a late completion.
pub fn finish(
    db: &Database,
    id: &str,
    status: &str,
    error_message: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET status = ?2, error_message = ?3, finished_at = ?4,
             transitioning = 0, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, status, error_message, now],
        )?;
        Ok(n == 1)
    })
}

/// Stamps `finished_at` on a job the executor observed as cancelled.
pub fn finish_cancelled(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET finished_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'cancelled' AND finished_at IS NULL",
            params![id, now],
        )?;
        Ok(n == 1)
    })
}

/// `running → cancelled`, operator pause.
pub fn pause(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET status = 'cancelled', transitioning = 0, updated_at = ?2
             WHERE id = ?1 AND status = 'running' AND transitioning = 0",
            params![id, now],
        )?;
        Ok(n == 1)
    })
}

/// `pending|running → cancelled`, operator cancel. A pending job never
/// reaches the executor, so it is stamped finished here.
pub fn cancel(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET
               finished_at = CASE WHEN status = 'pending' THEN ?2 ELSE finished_at END,
               status = 'cancelled', transitioning = 0, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'running') AND transitioning = 0",
            params![id, now],
        )?;
        Ok(n == 1)
    })
}

/// `failed → pending`, operator retry. Sets the transitioning guard until the
/// executor picks the job up again.
pub fn retry(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET status = 'pending', transitioning = 1, error_message = NULL,
             started_at = NULL, finished_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed' AND deleted_at IS NULL",
            params![id, now],
        )?;
        Ok(n == 1)
    })
}

/// Sets the soft-delete marker. Leaves the status untouched.
pub fn soft_delete(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now],
        )?;
        Ok(n == 1)
    })
}

/// Fails every job still marked `running`. Returns the affected ids.
pub fn fail_all_running(
    db: &Database,
    error_message: &str,
    now: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM jobs WHERE status = 'running'")?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        tx.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?1, finished_at = ?2,
             transitioning = 0, updated_at = ?2
             WHERE status = 'running'",
            params![error_message, now],
        )?;
        tx.commit()?;
        Ok(ids)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            job_type: "full_sync".to_string(),
            target_id: None,
            incremental: false,
            status: "pending".to_string(),
            transitioning: false,
            progress: "{}".to_string(),
            error_message: None,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
            started_at: None,
            finished_at: None,
            deleted_at: None,
        }
    }

    const NOW: &str = "2026-01-02T00:00:00.000000Z";

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let mut job = sample_job("job-1");
        job.target_id = Some("chan-9".to_string());
        job.incremental = true;
        insert(&db, &job).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found, job);
        assert_eq!(find_status(&db, "job-1").unwrap().as_deref(), Some("pending"));
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
        assert!(find_status(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_claim_is_fifo_and_single_flight() {
        let db = test_db();
        let mut a = sample_job("a");
        a.created_at = "2026-01-01T00:00:01.000000Z".to_string();
        let mut b = sample_job("b");
        b.created_at = "2026-01-01T00:00:02.000000Z".to_string();
        insert(&db, &b).unwrap();
        insert(&db, &a).unwrap();

        let claimed = claim_next_pending(&db, NOW).unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.status, "running");
        assert_eq!(claimed.started_at.as_deref(), Some(NOW));

        // Slot is held: nothing else can be claimed.
        assert!(claim_next_pending(&db, NOW).unwrap().is_none());

        assert!(finish(&db, "a", "completed", None, NOW).unwrap());
        let claimed = claim_next_pending(&db, NOW).unwrap().unwrap();
        assert_eq!(claimed.id, "b");
    }

    #[test]
    fn test_claim_skips_deleted() {
        let db = test_db();
        let mut deleted = sample_job("d");
        deleted.deleted_at = Some(NOW.to_string());
        insert(&db, &deleted).unwrap();

        assert!(claim_next_pending(&db, NOW).unwrap().is_none());
    }

    #[test]
    fn test_claim_same_created_at_uses_insertion_order() {
        let db = test_db();
        insert(&db, &sample_job("first")).unwrap();
        insert(&db, &sample_job("second")).unwrap();

        assert_eq!(claim_next_pending(&db, NOW).unwrap().unwrap().id, "first");
    }

    #[test]
    fn test_finish_requires_running() {
        let db = test_db();
        insert(&db, &sample_job("f1")).unwrap();
        assert!(!finish(&db, "f1", "completed", None, NOW).unwrap());

        claim_next_pending(&db, NOW).unwrap();
        assert!(finish(&db, "f1", "failed", Some("boom"), NOW).unwrap());
        let row = find_by_id(&db, "f1").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert_eq!(row.finished_at.as_deref(), Some(NOW));
    }

    #[test]
    fn test_pause_only_from_running() {
        let db = test_db();
        insert(&db, &sample_job("p1")).unwrap();
        assert!(!pause(&db, "p1", NOW).unwrap());
        assert_eq!(find_status(&db, "p1").unwrap().as_deref(), Some("pending"));

        claim_next_pending(&db, NOW).unwrap();
        assert!(pause(&db, "p1", NOW).unwrap());
        assert_eq!(find_status(&db, "p1").unwrap().as_deref(), Some("cancelled"));

        // A late completion does not overwrite the cancellation.
        assert!(!finish(&db, "p1", "completed", None, NOW).unwrap());
        assert!(finish_cancelled(&db, "p1", NOW).unwrap());
        assert!(!finish_cancelled(&db, "p1", NOW).unwrap());
    }

    #[test]
    fn test_cancel_pending_stamps_finished() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();
        assert!(cancel(&db, "c1", NOW).unwrap());

        let row = find_by_id(&db, "c1").unwrap().unwrap();
        assert_eq!(row.status, "cancelled");
        assert_eq!(row.finished_at.as_deref(), Some(NOW));
        assert!(!cancel(&db, "c1", NOW).unwrap());
    }

    #[test]
    fn test_retry_only_from_failed() {
        let db = test_db();
        insert(&db, &sample_job("r1")).unwrap();
        assert!(!retry(&db, "r1", NOW).unwrap());

        claim_next_pending(&db, NOW).unwrap();
        finish(&db, "r1", "failed", Some("network down"), NOW).unwrap();
        assert!(retry(&db, "r1", NOW).unwrap());

        let row = find_by_id(&db, "r1").unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.transitioning);
        assert!(row.error_message.is_none());
        assert!(row.finished_at.is_none());

        // Transitioning blocks a concurrent cancel until pickup.
        assert!(!cancel(&db, "r1", NOW).unwrap());
        let claimed = claim_next_pending(&db, NOW).unwrap().unwrap();
        assert!(!claimed.transitioning);
    }

    #[test]
    fn test_soft_delete_is_independent_of_status() {
        let db = test_db();
        insert(&db, &sample_job("s1")).unwrap();
        claim_next_pending(&db, NOW).unwrap();

        assert!(soft_delete(&db, "s1", NOW).unwrap());
        assert!(!soft_delete(&db, "s1", NOW).unwrap());

        let running = find_running(&db).unwrap().unwrap();
        assert_eq!(running.id, "s1");
        assert!(running.deleted_at.is_some());
    }

    #[test]
    fn test_query_filters() {
        let db = test_db();
        insert(&db, &sample_job("q1")).unwrap();

        let mut scan = sample_job("q2");
        scan.job_type = "channel_scan".to_string();
        scan.target_id = Some("UC_music".to_string());
        scan.created_at = "2026-01-05T00:00:00.000000Z".to_string();
        insert(&db, &scan).unwrap();

        let mut deleted = sample_job("q3");
        deleted.deleted_at = Some(NOW.to_string());
        insert(&db, &deleted).unwrap();

        let (rows, total) = query(&db, &JobFilter::default()).unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].id, "q2");

        let (_, total) = query(
            &db,
            &JobFilter {
                include_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 3);

        let (rows, total) = query(
            &db,
            &JobFilter {
                search: Some("music".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "q2");

        let (_, total) = query(
            &db,
            &JobFilter {
                from_date: Some("2026-01-03T00:00:00Z".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);

        let (_, total) = query(
            &db,
            &JobFilter {
                job_type: Some("full_sync".to_string()),
                status: Some("pending".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_query_search_matches_channel_name_and_escapes_wildcards() {
        let db = test_db();
        let mut job = sample_job("w1");
        job.progress = r#"{"currentChannelName":"Cooking 100%"}"#.to_string();
        insert(&db, &job).unwrap();
        insert(&db, &sample_job("w2")).unwrap();

        let search = |s: &str| {
            query(
                &db,
                &JobFilter {
                    search: Some(s.to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .1
        };
        assert_eq!(search("Cooking"), 1);
        assert_eq!(search("100%"), 1);
        assert_eq!(search("%"), 1);
    }

    #[test]
    fn test_query_pagination() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2026-01-{:02}T00:00:00.000000Z", i + 1);
            insert(&db, &job).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                offset: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "p6");
    }

    #[test]
    fn test_count_by_status_excludes_deleted() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();
        let mut deleted = sample_job("c2");
        deleted.deleted_at = Some(NOW.to_string());
        insert(&db, &deleted).unwrap();

        assert_eq!(count_by_status(&db, "pending").unwrap(), 1);
        assert_eq!(count_by_status(&db, "failed").unwrap(), 0);
    }

    #[test]
    fn test_fail_all_running() {
        let db = test_db();
        insert(&db, &sample_job("x1")).unwrap();
        insert(&db, &sample_job("x2")).unwrap();
        claim_next_pending(&db, NOW).unwrap();

        let ids = fail_all_running(&db, "interrupted", NOW).unwrap();
        assert_eq!(ids, vec!["x1".to_string()]);
        let row = find_by_id(&db, "x1").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("interrupted"));
        assert_eq!(find_status(&db, "x2").unwrap().as_deref(), Some("pending"));
    }
}
