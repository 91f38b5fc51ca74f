//! Single-concurrency job execution.
//!
//! At most one job is `running` at a time across every process sharing the
//! database. The persisted status is the only lock: [`JobQueue::process_queue`]
//! claims the oldest pending job inside one immediate transaction, runs it on
//! a background task, and calls itself again when the job reaches a terminal
//! state. Nothing here blocks waiting for a job to finish.

pub mod command;
pub mod scraper;

pub use command::CommandScraper;
pub use scraper::{JobReporter, ScrapeError, ScrapeUnit};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::cache::Cache;
use crate::error::Result;
use crate::event_log::EventLog;
use crate::jobs::{
    BulkOutcome, ControlOutcome, Job, JobStatus, JobStore, LogEntry, LogLevel, NewJob,
};

/// How a job's execution ended, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed,
    Failed(String),
    Cancelled,
}

struct QueueInner {
    store: JobStore,
    cache: Cache,
    events: EventLog,
    scraper: Option<Arc<dyn ScrapeUnit>>,
    max_logs_per_job: u64,
}

/// Owns job execution. Cloning is cheap and shares the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// A queue that executes jobs with `scraper`.
    pub fn new(
        store: JobStore,
        cache: Cache,
        events: EventLog,
        scraper: Arc<dyn ScrapeUnit>,
        max_logs_per_job: u64,
    ) -> Self {
        Self::build(store, cache, events, Some(scraper), max_logs_per_job)
    }

    /// A queue that only records jobs; another process executes them.
    pub fn submit_only(store: JobStore, cache: Cache, events: EventLog) -> Self {
        Self::build(store, cache, events, None, 0)
    }

    fn build(
        store: JobStore,
        cache: Cache,
        events: EventLog,
        scraper: Option<Arc<dyn ScrapeUnit>>,
        max_logs_per_job: u64,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                cache,
                events,
                scraper,
                max_logs_per_job,
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn is_executor(&self) -> bool {
        self.inner.scraper.is_some()
    }

    /// Validates and records a new pending job, then kicks the queue.
    pub fn create_job(
        &self,
        job_type: &str,
        target_id: Option<&str>,
        incremental: bool,
    ) -> Result<Job> {
        let new_job = NewJob::parse(job_type, target_id, incremental)?;
        let job = self.inner.store.create(&new_job)?;
        self.process_queue()?;
        Ok(job)
    }

    /// Starts the oldest pending job if nothing is running. Safe to call at
    /// any time from any task; returns the job it started, if any.
    pub fn process_queue(&self) -> Result<Option<Job>> {
        let Some(ref scraper) = self.inner.scraper else {
            log::debug!("Submit-only queue: leaving pending jobs to the executor process");
            return Ok(None);
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("process_queue called outside a tokio runtime, skipping");
            return Ok(None);
        };

        let Some(job) = self.inner.store.claim_next()? else {
            return Ok(None);
        };
        log::info!("Starting {} job {}", job.job_type, job.id);

        let queue = self.clone();
        let scraper = Arc::clone(scraper);
        let claimed = job.clone();
        runtime.spawn(async move {
            queue.execute(claimed, scraper).await;
            if let Err(e) = queue.process_queue() {
                log::error!("Failed to pick up next job: {}", e);
            }
        });

        Ok(Some(job))
    }

    async fn execute(&self, job: Job, scraper: Arc<dyn ScrapeUnit>) -> ExecutionResult {
        let store = &self.inner.store;
        let reporter = JobReporter::new(store.clone(), &job);
        reporter.log_entry(LogEntry::info(format!(
            "Started {} job{}{}",
            job.job_type,
            job.target_id
                .as_deref()
                .map(|t| format!(" for {}", t))
                .unwrap_or_default(),
            if job.incremental { " (incremental)" } else { "" }
        )));

        let outcome = AssertUnwindSafe(scraper.run(&job, &reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ScrapeError::Failed("scraper panicked".to_string())));

        let result = self.record_outcome(&job, &reporter, outcome);
        if self.inner.max_logs_per_job > 0 {
            if let Err(e) = store.prune_logs(&job.id, self.inner.max_logs_per_job) {
                log::warn!("Failed to apply log retention to job {}: {}", job.id, e);
            }
        }
        result
    }

    fn record_outcome(
        &self,
        job: &Job,
        reporter: &JobReporter,
        outcome: std::result::Result<(), ScrapeError>,
    ) -> ExecutionResult {
        let store = &self.inner.store;
        let progress = reporter.progress();

        // Summary lines go in before the status flips so a viewer that sees
        // the terminal status has already been able to read them.
        match outcome {
            Ok(()) => reporter.log_entry(LogEntry::info(format!(
                "Finished: {} videos added, {} items failed",
                progress.videos_added, progress.failed_items
            ))),
            // A unit may give up on its own while the job is still running.
            Err(ScrapeError::Cancelled) => {
                if !store.is_cancelled(&job.id).unwrap_or(true) {
                    reporter.log_entry(LogEntry::warn("Stopped by scraping unit"));
                }
            }
            Err(ref e) => reporter.log_entry(LogEntry::error(format!("Failed: {}", e))),
        }

        let finished = match outcome {
            Ok(()) => store.finish(&job.id, JobStatus::Completed, None),
            Err(ScrapeError::Cancelled) => store.finish(&job.id, JobStatus::Cancelled, None),
            Err(ref e) => store.finish(&job.id, JobStatus::Failed, Some(&e.to_string())),
        };

        match (finished, outcome) {
            (Ok(true), Ok(())) => {
                let invalidated = self.inner.cache.invalidate_content();
                log::info!(
                    "Job {} completed, invalidated {} cached content entries",
                    job.id,
                    invalidated
                );
                ExecutionResult::Completed
            }
            (Ok(true), Err(ScrapeError::Cancelled)) => {
                log::info!("Job {} stopped by its scraping unit", job.id);
                ExecutionResult::Cancelled
            }
            (Ok(true), Err(e)) => {
                let message = e.to_string();
                self.inner
                    .events
                    .record_quietly(LogLevel::Error, "queue", &message, Some(&job.id));
                ExecutionResult::Failed(message)
            }
            (Ok(false), _) => {
                // The job left `running` underneath us: an operator paused or
                // cancelled it.
                if let Err(e) = store.finish_cancelled(&job.id) {
                    log::error!("Failed to stamp cancelled job {}: {}", job.id, e);
                }
                reporter.log_entry(LogEntry::warn("Cancelled by operator"));
                log::info!("Job {} stopped after cancellation", job.id);
                ExecutionResult::Cancelled
            }
            (Err(e), _) => {
                // The job stays `running` until restart recovery; record why.
                log::error!("Failed to record outcome of job {}: {}", job.id, e);
                let message = format!("failed to record job outcome: {}", e);
                self.inner
                    .events
                    .record_quietly(LogLevel::Error, "queue", &message, Some(&job.id));
                ExecutionResult::Failed(message)
            }
        }
    }

    // ─── Operator controls ──────────────────────────────────────────────────

    /// `running → cancelled`. The scraping unit stops at its next checkpoint.
    pub fn pause(&self, id: &str) -> Result<ControlOutcome> {
        Ok(self.inner.store.pause(id)?)
    }

    /// `pending|running → cancelled`.
    pub fn cancel(&self, id: &str) -> Result<ControlOutcome> {
        Ok(self.inner.store.cancel(id)?)
    }

    /// `failed → pending`, then kicks the queue.
    pub fn retry(&self, id: &str) -> Result<ControlOutcome> {
        let outcome = self.inner.store.retry(id)?;
        if outcome.is_applied() {
            self.process_queue()?;
        }
        Ok(outcome)
    }

    /// Retries every failed job among `ids`, then kicks the queue once.
    pub fn bulk_retry(&self, ids: &[String]) -> Result<BulkOutcome> {
        let outcome = self.inner.store.bulk_retry(ids)?;
        if outcome.affected > 0 {
            self.process_queue()?;
        }
        Ok(outcome)
    }

    pub fn delete(&self, id: &str) -> Result<ControlOutcome> {
        Ok(self.inner.store.soft_delete(id)?)
    }

    pub fn bulk_delete(&self, ids: &[String]) -> Result<BulkOutcome> {
        Ok(self.inner.store.bulk_delete(ids)?)
    }
}
