//! Contract between the job queue and the external scraping unit.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::jobs::{Job, JobProgress, JobStore, LogEntry, LogLevel, ProgressUpdate};

#[derive(Error, Debug)]
pub enum ScrapeError {
    /// The unit decided the job as a whole cannot proceed.
    #[error("{0}")]
    Failed(String),

    #[error("Failed to launch scraper '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scraper I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The unit observed cancellation and stopped early.
    #[error("Cancelled")]
    Cancelled,
}

/// One unit of ingestion work. Implementations report progress through the
/// reporter and must check [`JobReporter::is_cancelled`] between items.
#[async_trait]
pub trait ScrapeUnit: Send + Sync {
    async fn run(&self, job: &Job, reporter: &JobReporter) -> Result<(), ScrapeError>;
}

/// Progress callback handed to a running [`ScrapeUnit`].
///
/// Reporting never fails from the unit's point of view: store errors are
/// logged and the job keeps going.
pub struct JobReporter {
    store: JobStore,
    job_id: String,
    progress: Mutex<JobProgress>,
}

impl JobReporter {
    pub(crate) fn new(store: JobStore, job: &Job) -> Self {
        Self {
            store,
            job_id: job.id.clone(),
            progress: Mutex::new(job.progress.clone()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn lock(&self) -> MutexGuard<'_, JobProgress> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Progress lock for job {} was poisoned, recovering", self.job_id);
                poisoned.into_inner()
            }
        }
    }

    /// Current counters as last reported.
    pub fn progress(&self) -> JobProgress {
        self.lock().clone()
    }

    fn persist(&self, progress: &JobProgress) {
        if let Err(e) = self.store.update_progress(&self.job_id, progress) {
            log::error!("Failed to persist progress for job {}: {}", self.job_id, e);
        }
    }

    fn append(&self, entry: &LogEntry) {
        if let Err(e) = self.store.append_log(&self.job_id, entry) {
            log::error!("Failed to append log for job {}: {}", self.job_id, e);
        }
    }

    /// Applies a partial counter update and optionally appends a log entry.
    pub fn report(&self, update: ProgressUpdate, entry: Option<LogEntry>) {
        if !update.is_empty() {
            let snapshot = {
                let mut progress = self.lock();
                update.apply(&mut progress);
                progress.clone()
            };
            self.persist(&snapshot);
        }
        if let Some(entry) = entry {
            self.append(&entry);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.append(&LogEntry::new(level, message));
    }

    pub fn log_entry(&self, entry: LogEntry) {
        self.append(&entry);
    }

    /// Adds `count` to `videosAdded`.
    pub fn videos_added(&self, count: u64) {
        let snapshot = {
            let mut progress = self.lock();
            progress.videos_added += count;
            progress.clone()
        };
        self.persist(&snapshot);
    }

    /// Records a per-item failure: bumps `failedItems` and logs a warning.
    /// The job continues.
    pub fn item_failed(&self, channel: Option<(&str, &str)>, message: impl Into<String>) {
        let snapshot = {
            let mut progress = self.lock();
            progress.failed_items += 1;
            progress.clone()
        };
        self.persist(&snapshot);

        let mut entry = LogEntry::warn(message);
        if let Some((id, name)) = channel {
            entry = entry.with_channel(id, name);
        }
        self.append(&entry);
    }

    /// Cooperative cancellation probe. A store error reads as "keep going".
    pub fn is_cancelled(&self) -> bool {
        match self.store.is_cancelled(&self.job_id) {
            Ok(cancelled) => cancelled,
            Err(e) => {
                log::warn!("Cancellation check for job {} failed: {}", self.job_id, e);
                false
            }
        }
    }
}
