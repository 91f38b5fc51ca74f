//! Job store with persistent database storage.
//!
//! `JobStore` is the only way the rest of the crate touches the `jobs` and
//! `job_logs` tables. State transitions map one-to-one onto the conditional
//! updates in [`job_repo`]; their outcome is reported as a value so callers can
//! tell "not eligible" apart from "not found" without treating either as a
//! failure.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Job, JobDetail, JobProgress, JobStatus, JobType, LogEntry, LogLevel, NewJob};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{format_timestamp, log_repo, Database, DatabaseError};
use crate::error::{Result, VidsyncError};

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: u64 = 50;
/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u64 = 500;

/// Error message stamped on jobs found `running` at daemon start.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by process restart";

type DbResult<T> = std::result::Result<T, DatabaseError>;

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// Result of a single-job control operation (pause, cancel, retry, delete).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// The transition happened; carries the job as it is now.
    Applied(Job),
    /// The job exists but its current state does not allow the transition.
    Ineligible { status: JobStatus, deleted: bool },
    NotFound,
}

impl ControlOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ControlOutcome::Applied(_))
    }
}

/// Result of a bulk operation. Ineligible or unknown ids are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub affected: u64,
    pub skipped: u64,
    pub affected_ids: Vec<String>,
}

impl BulkOutcome {
    fn tally(&mut self, id: &str, outcome: &ControlOutcome) {
        if outcome.is_applied() {
            self.affected += 1;
            self.affected_ids.push(id.to_string());
        } else {
            self.skipped += 1;
        }
    }
}

/// Per-status counts of non-deleted jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

// ─── Query types ────────────────────────────────────────────────────────────

/// Query parameters for job listing.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQueryParams {
    pub search: Option<String>,
    pub status: Option<String>,
    pub job_type: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (start of day, UTC).
    pub from_date: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (end of day, UTC).
    pub to_date: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Response for job listing with pagination.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
}

fn parse_date_bound(field: &str, value: &str, end_of_day: bool) -> Result<String> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(format_timestamp(dt.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        VidsyncError::invalid(format!(
            "{} must be an RFC 3339 timestamp or YYYY-MM-DD, got '{}'",
            field, value
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .unwrap_or_default();
    Ok(format_timestamp(date.and_time(time).and_utc()))
}

impl JobQueryParams {
    fn to_filter(&self) -> Result<JobFilter> {
        let status = match self.status.as_deref() {
            Some(s) => Some(s.parse::<JobStatus>()?.as_str().to_string()),
            None => None,
        };
        let job_type = match self.job_type.as_deref() {
            Some(t) => Some(t.parse::<JobType>()?.as_str().to_string()),
            None => None,
        };
        let from_date = self
            .from_date
            .as_deref()
            .map(|d| parse_date_bound("fromDate", d, false))
            .transpose()?;
        let to_date = self
            .to_date
            .as_deref()
            .map(|d| parse_date_bound("toDate", d, true))
            .transpose()?;
        if let (Some(from), Some(to)) = (&from_date, &to_date) {
            if from > to {
                return Err(VidsyncError::invalid("fromDate is after toDate"));
            }
        }

        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(VidsyncError::invalid(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        Ok(JobFilter {
            search: self
                .search
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            status,
            job_type,
            from_date,
            to_date,
            include_deleted: self.include_deleted,
            limit: Some(limit),
            offset: Some(self.offset.unwrap_or(0)),
        })
    }
}

fn mirror_to_process_log(job_id: &str, entry: &LogEntry) {
    let level = match entry.level {
        LogLevel::Debug => log::Level::Debug,
        LogLevel::Info => log::Level::Info,
        LogLevel::Warn => log::Level::Warn,
        LogLevel::Error => log::Level::Error,
    };
    match entry.channel_name {
        Some(ref channel) => log::log!(
            target: "vidsync::job",
            level,
            "[job {}] [{}] {}",
            job_id,
            channel,
            entry.message
        ),
        None => log::log!(target: "vidsync::job", level, "[job {}] {}", job_id, entry.message),
    }
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Persistent job store backed by rusqlite.
///
/// Cloning is cheap; every clone shares the same database handle.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a new `pending` job.
    pub fn create(&self, new_job: &NewJob) -> DbResult<Job> {
        let now = format_timestamp(Utc::now());
        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: new_job.job_type.as_str().to_string(),
            target_id: new_job.target_id.clone(),
            incremental: new_job.incremental,
            status: JobStatus::Pending.as_str().to_string(),
            transitioning: false,
            progress: serde_json::to_string(&JobProgress::default()).map_err(|e| {
                DatabaseError::Serialization {
                    column: "progress",
                    source: e,
                }
            })?,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            finished_at: None,
            deleted_at: None,
        };
        job_repo::insert(&self.db, &row)?;
        log::info!(
            "Created {} job {}{}",
            new_job.job_type,
            row.id,
            row.target_id
                .as_deref()
                .map(|t| format!(" for {}", t))
                .unwrap_or_default()
        );
        Ok(Job::from_job_row(&row))
    }

    /// Returns a job by id, including soft-deleted jobs.
    pub fn get(&self, id: &str) -> DbResult<Option<Job>> {
        Ok(job_repo::find_by_id(&self.db, id)?.map(|row| Job::from_job_row(&row)))
    }

    /// Returns a job with its complete log sequence.
    pub fn get_detail(&self, id: &str) -> DbResult<Option<JobDetail>> {
        let Some(job) = self.get(id)? else {
            return Ok(None);
        };
        let logs = self.logs_since(id, 0)?;
        Ok(Some(JobDetail { job, logs }))
    }

    /// The job holding the running slot, or else the next one in line.
    /// Soft-deleted jobs are never reported as active.
    pub fn get_active(&self) -> DbResult<Option<Job>> {
        if let Some(row) = job_repo::find_running(&self.db)? {
            if row.deleted_at.is_none() {
                return Ok(Some(Job::from_job_row(&row)));
            }
        }
        Ok(job_repo::find_next_pending(&self.db)?.map(|row| Job::from_job_row(&row)))
    }

    /// The job currently in `running`, deleted or not.
    pub fn get_running(&self) -> DbResult<Option<Job>> {
        Ok(job_repo::find_running(&self.db)?.map(|row| Job::from_job_row(&row)))
    }

    /// Lists jobs newest first with filters and pagination.
    pub fn list(&self, params: &JobQueryParams) -> Result<JobListResponse> {
        let filter = params.to_filter()?;
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        Ok(JobListResponse {
            jobs: rows.iter().map(Job::from_job_row).collect(),
            total,
            limit: filter.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            offset: filter.offset.unwrap_or(0),
        })
    }

    pub fn counts(&self) -> DbResult<JobCounts> {
        Ok(JobCounts {
            pending: job_repo::count_by_status(&self.db, JobStatus::Pending.as_str())?,
            running: job_repo::count_by_status(&self.db, JobStatus::Running.as_str())?,
            completed: job_repo::count_by_status(&self.db, JobStatus::Completed.as_str())?,
            failed: job_repo::count_by_status(&self.db, JobStatus::Failed.as_str())?,
            cancelled: job_repo::count_by_status(&self.db, JobStatus::Cancelled.as_str())?,
        })
    }

    // ─── Logs ───────────────────────────────────────────────────────────────

    /// Appends an entry to the end of the job's log and returns its index.
    pub fn append_log(&self, id: &str, entry: &LogEntry) -> DbResult<u64> {
        let seq = log_repo::append(&self.db, &entry.to_log_row(id))?;
        mirror_to_process_log(id, entry);
        Ok(seq)
    }

    /// Number of entries ever appended to the job's log.
    pub fn log_length(&self, id: &str) -> DbResult<u64> {
        log_repo::length(&self.db, id)
    }

    /// Entries at index `from` and beyond, in order.
    pub fn logs_since(&self, id: &str, from: u64) -> DbResult<Vec<LogEntry>> {
        Ok(log_repo::since(&self.db, id, from)?
            .iter()
            .map(LogEntry::from_log_row)
            .collect())
    }

    /// Entries with index in `from..to`, in order.
    pub fn logs_between(&self, id: &str, from: u64, to: u64) -> DbResult<Vec<LogEntry>> {
        Ok(log_repo::range(&self.db, id, from, to)?
            .iter()
            .map(LogEntry::from_log_row)
            .collect())
    }

    /// The last `limit` entries, in order.
    pub fn log_tail(&self, id: &str, limit: u64) -> DbResult<Vec<LogEntry>> {
        Ok(log_repo::tail(&self.db, id, limit)?
            .iter()
            .map(LogEntry::from_log_row)
            .collect())
    }

    /// Renders the job's log as JSON Lines, one entry per line.
    pub fn export_logs(&self, id: &str) -> DbResult<Option<String>> {
        if job_repo::find_status(&self.db, id)?.is_none() {
            return Ok(None);
        }
        let mut out = String::new();
        for entry in self.logs_since(id, 0)? {
            let line = serde_json::to_string(&entry).map_err(|e| DatabaseError::Serialization {
                column: "job_logs",
                source: e,
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(Some(out))
    }

    /// Drops the oldest log entries so at most `keep_last` remain.
    pub fn prune_logs(&self, id: &str, keep_last: u64) -> DbResult<usize> {
        let removed = log_repo::prune(&self.db, id, keep_last)?;
        if removed > 0 {
            log::debug!("Pruned {} log entries from job {}", removed, id);
        }
        Ok(removed)
    }

    // ─── Executor transitions ───────────────────────────────────────────────

    /// Moves the oldest eligible pending job to `running`, if the slot is free.
    pub fn claim_next(&self) -> DbResult<Option<Job>> {
        let now = format_timestamp(Utc::now());
        Ok(job_repo::claim_next_pending(&self.db, &now)?.map(|row| Job::from_job_row(&row)))
    }

    pub fn update_progress(&self, id: &str, progress: &JobProgress) -> DbResult<()> {
        let json = serde_json::to_string(progress).map_err(|e| DatabaseError::Serialization {
            column: "progress",
            source: e,
        })?;
        job_repo::update_progress(&self.db, id, &json, &format_timestamp(Utc::now()))?;
        Ok(())
    }

    /// Records the executor's terminal result. Returns false when the job is
    /// no longer `running`, e.g. because an operator cancelled it.
    pub fn finish(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        job_repo::finish(
            &self.db,
            id,
            status.as_str(),
            error_message,
            &format_timestamp(Utc::now()),
        )
    }

    /// Stamps `finishedAt` once the executor has stopped a cancelled job.
    pub fn finish_cancelled(&self, id: &str) -> DbResult<bool> {
        job_repo::finish_cancelled(&self.db, id, &format_timestamp(Utc::now()))
    }

    /// Cooperative cancellation probe. Anything but `running` means stop.
    pub fn is_cancelled(&self, id: &str) -> DbResult<bool> {
        Ok(job_repo::find_status(&self.db, id)?.as_deref() != Some(JobStatus::Running.as_str()))
    }

    /// Fails every job left `running` by a previous process.
    pub fn recover_interrupted(&self) -> DbResult<Vec<String>> {
        let now = format_timestamp(Utc::now());
        let ids = job_repo::fail_all_running(&self.db, INTERRUPTED_MESSAGE, &now)?;
        for id in &ids {
            log::warn!("Job {} was running when the process stopped, marking failed", id);
            self.append_log(id, &LogEntry::error(INTERRUPTED_MESSAGE))?;
        }
        Ok(ids)
    }

    // ─── Operator transitions ───────────────────────────────────────────────

    fn control<F>(&self, id: &str, op: &str, apply: F) -> DbResult<ControlOutcome>
    where
        F: FnOnce(&Database, &str, &str) -> DbResult<bool>,
    {
        let now = format_timestamp(Utc::now());
        if apply(&self.db, id, &now)? {
            log::info!("Job {}: {} applied", id, op);
            return Ok(match self.get(id)? {
                Some(job) => ControlOutcome::Applied(job),
                None => ControlOutcome::NotFound,
            });
        }
        Ok(match self.get(id)? {
            Some(job) => {
                log::debug!("Job {}: {} not eligible in status {}", id, op, job.status);
                ControlOutcome::Ineligible {
                    status: job.status,
                    deleted: job.is_deleted(),
                }
            }
            None => ControlOutcome::NotFound,
        })
    }

    /// `running → cancelled`. Rejected for any other status.
    pub fn pause(&self, id: &str) -> DbResult<ControlOutcome> {
        self.control(id, "pause", job_repo::pause)
    }

    /// `pending|running → cancelled`.
    pub fn cancel(&self, id: &str) -> DbResult<ControlOutcome> {
        self.control(id, "cancel", job_repo::cancel)
    }

    /// `failed → pending`, clearing the error.
    pub fn retry(&self, id: &str) -> DbResult<ControlOutcome> {
        self.control(id, "retry", job_repo::retry)
    }

    /// Hides the job from listings. Does not stop a running job.
    pub fn soft_delete(&self, id: &str) -> DbResult<ControlOutcome> {
        self.control(id, "delete", job_repo::soft_delete)
    }

    pub fn bulk_retry(&self, ids: &[String]) -> DbResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            outcome.tally(id, &self.retry(id)?);
        }
        Ok(outcome)
    }

    pub fn bulk_delete(&self, ids: &[String]) -> DbResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            outcome.tally(id, &self.soft_delete(id)?);
        }
        Ok(outcome)
    }
}
