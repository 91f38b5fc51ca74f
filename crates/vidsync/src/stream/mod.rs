//! Live job streaming for remote viewers.
//!
//! Each viewer gets its own polling loop that re-reads the job on a fixed
//! tick, diffs it against what that viewer has already been sent, and emits
//! discrete [`StreamEvent`]s. Nothing is pushed from the job queue; a viewer
//! sees any change within one poll interval.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::StreamConfig;
use crate::db::DatabaseError;
use crate::event_log::EventLog;
use crate::jobs::{Job, JobStatus, JobStore, LogEntry, LogLevel};

const CHANNEL_CAPACITY: usize = 64;

/// One message to a viewer. Serializes as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The job without its log, sent whenever it changes.
    Snapshot { job: Job },
    /// First batch of log entries for this viewer: the newest entries, capped.
    #[serde(rename_all = "camelCase")]
    LogsInit {
        job_id: String,
        entries: Vec<LogEntry>,
        /// Log length at the time of the batch.
        total: u64,
    },
    /// Entries appended since the previous batch.
    #[serde(rename_all = "camelCase")]
    Log {
        job_id: String,
        from_index: u64,
        entries: Vec<LogEntry>,
    },
    #[serde(rename_all = "camelCase")]
    JobComplete {
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// The active job was replaced by a different one; cursor state was
    /// reset. Coming out of idle sends a fresh snapshot and `logs_init` only.
    #[serde(rename_all = "camelCase")]
    JobChanged {
        previous_job_id: String,
        job_id: String,
    },
    /// No job is active. Sent on every tick while idle.
    Idle,
    Ping { time: DateTime<Utc> },
    Error { message: String },
    End { reason: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Snapshot { .. } => "snapshot",
            StreamEvent::LogsInit { .. } => "logs_init",
            StreamEvent::Log { .. } => "log",
            StreamEvent::JobComplete { .. } => "job_complete",
            StreamEvent::JobChanged { .. } => "job_changed",
            StreamEvent::Idle => "idle",
            StreamEvent::Ping { .. } => "ping",
            StreamEvent::Error { .. } => "error",
            StreamEvent::End { .. } => "end",
        }
    }
}

/// What a stream follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Job(String),
    /// Whichever job is running, or else next in line.
    Active,
}

/// Events produced by one poll tick.
#[derive(Debug, Default, PartialEq)]
pub struct Tick {
    pub events: Vec<StreamEvent>,
    /// The stream has ended; no further ticks should run.
    pub finished: bool,
}

/// Per-viewer diff state.
#[derive(Debug)]
pub struct ViewerCursor {
    target: StreamTarget,
    initial_log_limit: u64,
    last_snapshot: Option<String>,
    last_log_index: u64,
    last_status: Option<JobStatus>,
    initialized: bool,
    /// Active variant only: the job this cursor currently follows.
    active_job_id: Option<String>,
}

impl ViewerCursor {
    pub fn new(target: StreamTarget, initial_log_limit: u64) -> Self {
        Self {
            target,
            initial_log_limit,
            last_snapshot: None,
            last_log_index: 0,
            last_status: None,
            initialized: false,
            active_job_id: None,
        }
    }

    fn reset(&mut self) {
        self.last_snapshot = None;
        self.last_log_index = 0;
        self.last_status = None;
        self.initialized = false;
        self.active_job_id = None;
    }

    /// Reads the store once and returns what this viewer has not seen yet.
    pub fn poll(&mut self, store: &JobStore) -> Result<Tick, DatabaseError> {
        let mut tick = Tick::default();
        match self.target.clone() {
            StreamTarget::Job(id) => match store.get(&id)? {
                Some(job) => self.diff_job(store, &job, &mut tick.events)?,
                None => {
                    tick.events.push(StreamEvent::End {
                        reason: format!("job {} not found", id),
                    });
                    tick.finished = true;
                }
            },
            StreamTarget::Active => self.poll_active(store, &mut tick.events)?,
        }
        Ok(tick)
    }

    fn poll_active(
        &mut self,
        store: &JobStore,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), DatabaseError> {
        let active = store.get_active()?;
        let previous = self.active_job_id.clone();

        if let Some(ref prev_id) = previous {
            if active.as_ref().map(|j| &j.id) != Some(prev_id) {
                // Flush the final state of the job we were following so the
                // viewer still sees its last lines and completion.
                if let Some(prev_job) = store.get(prev_id)? {
                    self.diff_job(store, &prev_job, events)?;
                }
                self.reset();
            }
        }

        match active {
            None => events.push(StreamEvent::Idle),
            Some(job) => {
                if self.active_job_id.is_none() {
                    if let Some(previous_job_id) = previous {
                        events.push(StreamEvent::JobChanged {
                            previous_job_id,
                            job_id: job.id.clone(),
                        });
                    }
                    self.active_job_id = Some(job.id.clone());
                }
                self.diff_job(store, &job, events)?;
            }
        }
        Ok(())
    }

    fn diff_job(
        &mut self,
        store: &JobStore,
        job: &Job,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), DatabaseError> {
        let snapshot = job.snapshot();
        if self.last_snapshot.as_deref() != Some(snapshot.as_str()) {
            events.push(StreamEvent::Snapshot { job: job.clone() });
            self.last_snapshot = Some(snapshot);
        }

        let length = store.log_length(&job.id)?;
        if !self.initialized {
            let from = length.saturating_sub(self.initial_log_limit);
            events.push(StreamEvent::LogsInit {
                job_id: job.id.clone(),
                entries: store.logs_between(&job.id, from, length)?,
                total: length,
            });
            self.last_log_index = length;
            self.initialized = true;
        } else if length > self.last_log_index {
            events.push(StreamEvent::Log {
                job_id: job.id.clone(),
                from_index: self.last_log_index,
                entries: store.logs_between(&job.id, self.last_log_index, length)?,
            });
            self.last_log_index = length;
        }

        let finished = matches!(job.status, JobStatus::Completed | JobStatus::Failed);
        if finished && self.last_status.is_some_and(|prev| prev != job.status) {
            events.push(StreamEvent::JobComplete {
                job_id: job.id.clone(),
                status: job.status,
                error_message: job.error_message.clone(),
            });
        }
        self.last_status = Some(job.status);
        Ok(())
    }
}

/// A running viewer stream. Dropping it stops the polling task.
pub struct JobStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl JobStream {
    /// Starts polling on the current tokio runtime.
    pub fn spawn(
        store: JobStore,
        events: Option<EventLog>,
        target: StreamTarget,
        config: &StreamConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let poll_every = Duration::from_millis(config.poll_interval_ms.max(1));
        let heartbeat_every = Duration::from_secs(config.heartbeat_secs.max(1));
        let max_errors = config.max_consecutive_errors.max(1);
        let cursor = ViewerCursor::new(target, config.initial_log_limit);

        let task = tokio::spawn(run_stream(
            store,
            events,
            cursor,
            tx,
            poll_every,
            heartbeat_every,
            max_errors,
        ));
        Self { rx, task }
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for JobStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_stream(
    store: JobStore,
    event_log: Option<EventLog>,
    mut cursor: ViewerCursor,
    tx: mpsc::Sender<StreamEvent>,
    poll_every: Duration,
    heartbeat_every: Duration,
    max_errors: u32,
) {
    let mut poll = tokio::time::interval(poll_every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match cursor.poll(&store) {
                    Ok(tick) => {
                        consecutive_errors = 0;
                        for event in tick.events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        if tick.finished {
                            return;
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        let message = format!("failed to read job state: {}", e);
                        log::warn!("Stream read error ({} in a row): {}", consecutive_errors, e);
                        if let Some(ref events) = event_log {
                            events.record_quietly(LogLevel::Warn, "stream", &message, None);
                        }
                        if tx.send(StreamEvent::Error { message }).await.is_err() {
                            return;
                        }
                        if consecutive_errors >= max_errors {
                            let reason = format!(
                                "store unreachable after {} attempts",
                                consecutive_errors
                            );
                            let _ = tx.send(StreamEvent::End { reason }).await;
                            return;
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                if tx.send(StreamEvent::Ping { time: Utc::now() }).await.is_err() {
                    return;
                }
            }
            _ = tx.closed() => {
                log::debug!("Stream viewer disconnected");
                return;
            }
        }
    }
}
