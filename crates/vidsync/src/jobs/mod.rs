//! Job domain types and the persistent job store.

pub mod store;

pub use store::{
    BulkOutcome, ControlOutcome, JobCounts, JobListResponse, JobQueryParams, JobStore,
};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::log_repo::LogRow;
use crate::db::{format_timestamp, parse_timestamp};
use crate::error::VidsyncError;

// ─── Enums ──────────────────────────────────────────────────────────────────

/// Kind of ingestion work a job performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullSync,
    ChannelScan,
    SchedulerIncremental,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::FullSync,
        JobType::ChannelScan,
        JobType::SchedulerIncremental,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullSync => "full_sync",
            JobType::ChannelScan => "channel_scan",
            JobType::SchedulerIncremental => "scheduler_incremental",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = VidsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                VidsyncError::invalid(format!(
                    "unknown job type '{}' (expected one of full_sync, channel_scan, scheduler_incremental)",
                    s
                ))
            })
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs only change through retry or
    /// soft delete.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    fn parse_stored(s: &str, job_id: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown job status '{}' for job {}, treating as failed",
                s,
                job_id
            );
            JobStatus::Failed
        })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = VidsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| VidsyncError::invalid(format!("unknown job status '{}'", s)))
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn parse_stored(s: &str) -> Self {
        match s {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── LogEntry ───────────────────────────────────────────────────────────────

/// One line of a job's log. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
            channel_id: None,
            channel_name: None,
            data: None,
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_channel(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.channel_id = Some(id.into());
        self.channel_name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn from_log_row(row: &LogRow) -> Self {
        Self {
            time: parse_timestamp(&row.time),
            level: LogLevel::parse_stored(&row.level),
            message: row.message.clone(),
            channel_id: row.channel_id.clone(),
            channel_name: row.channel_name.clone(),
            data: row
                .data
                .as_deref()
                .and_then(|d| serde_json::from_str(d).ok()),
        }
    }

    pub(crate) fn to_log_row(&self, job_id: &str) -> LogRow {
        LogRow {
            job_id: job_id.to_string(),
            seq: 0,
            time: format_timestamp(self.time),
            level: self.level.as_str().to_string(),
            message: self.message.clone(),
            channel_id: self.channel_id.clone(),
            channel_name: self.channel_name.clone(),
            data: self.data.as_ref().map(|d| d.to_string()),
        }
    }
}

// ─── Progress ───────────────────────────────────────────────────────────────

/// Counters reported by the scraping unit while a job runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct JobProgress {
    pub videos_added: u64,
    pub failed_items: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_channel_name: Option<String>,
    pub total_items: u64,
    pub processed_items: u64,
}

/// A partial progress report. Present fields overwrite the stored counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressUpdate {
    pub videos_added: Option<u64>,
    pub failed_items: Option<u64>,
    pub current_channel_name: Option<String>,
    pub total_items: Option<u64>,
    pub processed_items: Option<u64>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProgressUpdate::default()
    }

    pub fn apply(&self, progress: &mut JobProgress) {
        if let Some(v) = self.videos_added {
            progress.videos_added = v;
        }
        if let Some(v) = self.failed_items {
            progress.failed_items = v;
        }
        if let Some(ref name) = self.current_channel_name {
            progress.current_channel_name = Some(name.clone());
        }
        if let Some(v) = self.total_items {
            progress.total_items = v;
        }
        if let Some(v) = self.processed_items {
            progress.processed_items = v;
        }
    }
}

// ─── Job ────────────────────────────────────────────────────────────────────

/// A validated request to create a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_id: Option<String>,
    pub incremental: bool,
}

impl NewJob {
    /// Validates raw operator input. `channel_scan` needs a target.
    pub fn parse(
        job_type: &str,
        target_id: Option<&str>,
        incremental: bool,
    ) -> Result<Self, VidsyncError> {
        let job_type: JobType = job_type.parse()?;
        let target_id = target_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if job_type == JobType::ChannelScan && target_id.is_none() {
            return Err(VidsyncError::invalid("channel_scan jobs require a target id"));
        }
        Ok(Self {
            job_type,
            target_id,
            incremental,
        })
    }
}

/// A job as seen by callers. The log sequence is read separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub incremental: bool,
    pub status: JobStatus,
    pub transitioning: bool,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn from_job_row(row: &JobRow) -> Self {
        let job_type = row.job_type.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown job type '{}' for job {}, treating as full_sync",
                row.job_type,
                row.id
            );
            JobType::FullSync
        });
        let progress = serde_json::from_str(&row.progress).unwrap_or_else(|e| {
            log::warn!("Corrupt progress for job {}: {}", row.id, e);
            JobProgress::default()
        });

        Self {
            id: row.id.clone(),
            job_type,
            target_id: row.target_id.clone(),
            incremental: row.incremental,
            status: JobStatus::parse_stored(&row.status, &row.id),
            transitioning: row.transitioning,
            progress,
            error_message: row.error_message.clone(),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            finished_at: row.finished_at.as_deref().map(parse_timestamp),
            deleted_at: row.deleted_at.as_deref().map(parse_timestamp),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Canonical serialization used for change detection by stream viewers.
    pub fn snapshot(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A job together with its full log sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub logs: Vec<LogEntry>,
}
