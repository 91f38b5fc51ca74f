//! Recurring `scheduler_incremental` jobs on a wall-clock interval.
//!
//! Settings live in the singleton `scheduler_settings` row, so `start`/`stop`
//! issued from one process are picked up by the executor process through
//! [`Scheduler::reconcile`]. Only an executing queue arms a timer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{is_valid_timezone, RunNowPolicy, SchedulerConfig};
use crate::db::settings_repo::{self, SettingsRow};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::error::{Result, VidsyncError};
use crate::jobs::{Job, JobType};
use crate::queue::JobQueue;

pub const MIN_INTERVAL_HOURS: u32 = 1;
pub const MAX_INTERVAL_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub interval_hours: u32,
    pub timezone: String,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl SchedulerSettings {
    fn from_row(row: &SettingsRow) -> Self {
        Self {
            interval_hours: row.interval_hours,
            timezone: row.timezone.clone(),
            is_active: row.is_active,
            last_run: row.last_run.as_deref().map(parse_timestamp),
            next_run: row.next_run.as_deref().map(parse_timestamp),
        }
    }

    fn to_row(&self) -> SettingsRow {
        SettingsRow {
            interval_hours: self.interval_hours,
            timezone: self.timezone.clone(),
            is_active: self.is_active,
            last_run: self.last_run.map(format_timestamp),
            next_run: self.next_run.map(format_timestamp),
            updated_at: format_timestamp(Utc::now()),
        }
    }

    fn interval(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.interval_hours))
    }
}

/// Fields an operator may change. `None` leaves the value as is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub interval_hours: Option<u32>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    #[serde(flatten)]
    pub settings: SchedulerSettings,
    /// Whether this process holds an armed timer.
    pub timer_armed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_job: Option<Job>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowOutcome {
    pub job: Job,
    /// Another job held the running slot; this one waits behind it.
    pub already_running: bool,
}

#[derive(Default)]
struct TimerState {
    handle: Option<JoinHandle<()>>,
    /// `nextRun` the armed timer is sleeping towards.
    target: Option<DateTime<Utc>>,
    /// Interval captured when the timer was armed. Saved setting changes
    /// apply only after the schedule is stopped and started again.
    interval_hours: Option<u32>,
}

struct SchedulerInner {
    db: Database,
    queue: JobQueue,
    config: SchedulerConfig,
    timer: Mutex<TimerState>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(db: Database, queue: JobQueue, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                queue,
                config,
                timer: Mutex::new(TimerState::default()),
            }),
        }
    }

    fn timer(&self) -> MutexGuard<'_, TimerState> {
        match self.inner.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Scheduler timer lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Persisted settings, or the configured defaults if never saved.
    pub fn settings(&self) -> std::result::Result<SchedulerSettings, DatabaseError> {
        Ok(match settings_repo::load(&self.inner.db)? {
            Some(row) => SchedulerSettings::from_row(&row),
            None => SchedulerSettings {
                interval_hours: self.inner.config.default_interval_hours,
                timezone: self.inner.config.default_timezone.clone(),
                is_active: false,
                last_run: None,
                next_run: None,
            },
        })
    }

    fn save(&self, settings: &SchedulerSettings) -> std::result::Result<(), DatabaseError> {
        settings_repo::save(&self.inner.db, &settings.to_row())
    }

    pub fn is_armed(&self) -> bool {
        self.timer()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            settings: self.settings()?,
            timer_armed: self.is_armed(),
            running_job: self.inner.queue.store().get_running()?,
        })
    }

    /// Activates the schedule. Returns false if it was already active.
    pub fn start(&self) -> Result<bool> {
        let mut settings = self.settings()?;
        if settings.is_active {
            log::debug!("Scheduler already active");
            self.reconcile()?;
            return Ok(false);
        }

        settings.is_active = true;
        settings.next_run = Some(Utc::now() + settings.interval());
        self.save(&settings)?;
        log::info!(
            "Scheduler started: every {}h ({}), next run {}",
            settings.interval_hours,
            settings.timezone,
            settings.next_run.map(format_timestamp).unwrap_or_default()
        );
        self.reconcile()?;
        Ok(true)
    }

    /// Deactivates the schedule. A running job is left alone.
    pub fn stop(&self) -> Result<bool> {
        let mut settings = self.settings()?;
        let was_active = settings.is_active;
        settings.is_active = false;
        settings.next_run = None;
        self.save(&settings)?;
        self.disarm();
        if was_active {
            log::info!("Scheduler stopped");
        }
        Ok(was_active)
    }

    /// Validates and saves new settings. An active schedule keeps its
    /// current timer until it is stopped and started again.
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<SchedulerSettings> {
        let mut settings = self.settings()?;

        if let Some(hours) = update.interval_hours {
            if !(MIN_INTERVAL_HOURS..=MAX_INTERVAL_HOURS).contains(&hours) {
                return Err(VidsyncError::invalid(format!(
                    "intervalHours must be between {} and {}, got {}",
                    MIN_INTERVAL_HOURS, MAX_INTERVAL_HOURS, hours
                )));
            }
            settings.interval_hours = hours;
        }
        if let Some(ref tz) = update.timezone {
            let tz = tz.trim();
            if !is_valid_timezone(tz) {
                return Err(VidsyncError::invalid(format!("unrecognised timezone '{}'", tz)));
            }
            settings.timezone = tz.to_string();
        }

        self.save(&settings)?;
        if settings.is_active {
            log::info!("Scheduler settings saved; restart the scheduler to apply the new interval");
        }
        Ok(settings)
    }

    /// Creates a `full_sync` job immediately, outside the timer.
    pub fn run_now(&self) -> Result<RunNowOutcome> {
        let already_running = self.inner.queue.store().get_running()?.is_some();
        if already_running && self.inner.config.run_now_when_busy == RunNowPolicy::Reject {
            return Err(VidsyncError::Conflict("a job is already running".to_string()));
        }
        let job = self
            .inner
            .queue
            .create_job(JobType::FullSync.as_str(), None, false)?;
        if already_running {
            log::info!("Run-now job {} queued behind the running job", job.id);
        }
        Ok(RunNowOutcome {
            job,
            already_running,
        })
    }

    /// Enqueues an incremental job and advances the schedule by the armed
    /// interval, or the saved one when no timer is armed.
    pub fn fire(&self) -> Result<Job> {
        let interval_hours = self.timer().interval_hours;
        self.fire_with(interval_hours, false)
    }

    fn fire_with(&self, interval_hours: Option<u32>, from_timer: bool) -> Result<Job> {
        let job = self
            .inner
            .queue
            .create_job(JobType::SchedulerIncremental.as_str(), None, true)?;

        let mut settings = self.settings()?;
        let now = Utc::now();
        settings.last_run = Some(now);
        if settings.is_active {
            let hours = interval_hours.unwrap_or(settings.interval_hours);
            let next = now + chrono::Duration::hours(i64::from(hours));
            if from_timer {
                // Before the save, so reconcile never sees a stale target.
                self.timer().target = Some(next);
            }
            settings.next_run = Some(next);
        }
        self.save(&settings)?;
        log::info!(
            "Scheduled run created job {}, next run {}",
            job.id,
            settings.next_run.map(format_timestamp).unwrap_or_default()
        );
        Ok(job)
    }

    /// Re-arms the timer after a restart if the schedule was active.
    pub fn restore(&self) -> Result<()> {
        let settings = self.settings()?;
        if settings.is_active {
            log::info!(
                "Restoring active scheduler (every {}h, next run {})",
                settings.interval_hours,
                settings.next_run.map(format_timestamp).unwrap_or_default()
            );
        }
        self.reconcile()
    }

    /// Brings the local timer in line with the persisted settings.
    pub fn reconcile(&self) -> Result<()> {
        if !self.inner.queue.is_executor() {
            return Ok(());
        }
        let settings = self.settings()?;
        if !settings.is_active {
            if self.is_armed() {
                log::info!("Scheduler deactivated elsewhere, disarming timer");
                self.disarm();
            }
            return Ok(());
        }

        let next_run = match settings.next_run {
            Some(next) => next,
            None => {
                let mut settings = settings.clone();
                let next = Utc::now() + settings.interval();
                settings.next_run = Some(next);
                self.save(&settings)?;
                next
            }
        };
        let current_target = self.timer().target;
        if !self.is_armed() || current_target != Some(next_run) {
            self.arm(next_run, settings.interval_hours);
        }
        Ok(())
    }

    fn arm(&self, first_run: DateTime<Utc>, interval_hours: u32) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Cannot arm scheduler timer outside a tokio runtime");
            return;
        };

        // The task holds a weak reference so dropping the scheduler stops it.
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            let mut next = first_run;
            loop {
                let delay = match weak.upgrade() {
                    Some(inner) => {
                        Scheduler { inner }.timer().target = Some(next);
                        (next - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                    }
                    None => return,
                };
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let scheduler = Scheduler { inner };
                if let Err(e) = scheduler.fire_with(Some(interval_hours), true) {
                    log::error!("Scheduled run failed: {}", e);
                }
                match scheduler.settings() {
                    Ok(s) if s.is_active => {
                        let now = Utc::now();
                        next = match s.next_run {
                            Some(n) if n > now => n,
                            _ => now + chrono::Duration::hours(i64::from(interval_hours)),
                        };
                    }
                    Ok(_) => {
                        scheduler.timer().target = None;
                        return;
                    }
                    Err(e) => {
                        log::error!("Failed to reload scheduler settings: {}", e);
                        scheduler.timer().target = None;
                        return;
                    }
                }
            }
        });

        let mut timer = self.timer();
        if let Some(old) = timer.handle.replace(handle) {
            old.abort();
        }
        timer.target = Some(first_run);
        timer.interval_hours = Some(interval_hours);
    }

    fn disarm(&self) {
        let mut timer = self.timer();
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.target = None;
        timer.interval_hours = None;
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let timer = match self.timer.get_mut() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::event_log::EventLog;
    use crate::jobs::{JobQueryParams, JobStatus, JobStore};
    use crate::queue::{JobReporter, ScrapeError, ScrapeUnit};
    use async_trait::async_trait;

    /// Never finishes on its own; holds the running slot.
    struct BlockingScraper;

    #[async_trait]
    impl ScrapeUnit for BlockingScraper {
        async fn run(
            &self,
            _job: &Job,
            reporter: &JobReporter,
        ) -> std::result::Result<(), ScrapeError> {
            while !reporter.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(ScrapeError::Cancelled)
        }
    }

    fn scheduler(config: SchedulerConfig, executor: bool) -> Scheduler {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let cache = Cache::new(10, Duration::from_secs(60));
        let events = EventLog::new(db.clone());
        let queue = if executor {
            JobQueue::new(store, cache, events, Arc::new(BlockingScraper), 100)
        } else {
            JobQueue::submit_only(store, cache, events)
        };
        Scheduler::new(db, queue, config)
    }

    fn jobs_of_type(s: &Scheduler, job_type: &str) -> u64 {
        s.inner
            .queue
            .store()
            .list(&JobQueryParams {
                job_type: Some(job_type.to_string()),
                ..Default::default()
            })
            .unwrap()
            .total
    }

    #[tokio::test]
    async fn test_defaults_before_first_save() {
        let s = scheduler(SchedulerConfig::default(), false);
        let settings = s.settings().unwrap();
        assert_eq!(settings.interval_hours, 6);
        assert_eq!(settings.timezone, "UTC");
        assert!(!settings.is_active);
    }

    #[tokio::test]
    async fn test_update_settings_validation() {
        let s = scheduler(SchedulerConfig::default(), false);
        for hours in [0, 25] {
            let err = s
                .update_settings(&SettingsUpdate {
                    interval_hours: Some(hours),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, VidsyncError::InvalidArgument(_)));
        }
        assert!(s
            .update_settings(&SettingsUpdate {
                timezone: Some("Nowhere Land".to_string()),
                ..Default::default()
            })
            .is_err());

        let saved = s
            .update_settings(&SettingsUpdate {
                interval_hours: Some(2),
                timezone: Some("Europe/Zurich".to_string()),
            })
            .unwrap();
        assert_eq!(saved.interval_hours, 2);
        assert_eq!(s.settings().unwrap().timezone, "Europe/Zurich");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sets_next_run_and_fires() {
        let s = scheduler(SchedulerConfig::default(), true);
        s.update_settings(&SettingsUpdate {
            interval_hours: Some(1),
            ..Default::default()
        })
        .unwrap();

        let before = Utc::now();
        assert!(s.start().unwrap());
        assert!(!s.start().unwrap());
        let settings = s.settings().unwrap();
        let next = settings.next_run.unwrap();
        assert!(next >= before + chrono::Duration::hours(1));
        assert!(next <= Utc::now() + chrono::Duration::hours(1));
        assert!(s.is_armed());
        assert_eq!(jobs_of_type(&s, "scheduler_incremental"), 0);

        tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
        assert_eq!(jobs_of_type(&s, "scheduler_incremental"), 1);
        let settings = s.settings().unwrap();
        assert!(settings.last_run.is_some());
        assert!(settings.next_run.unwrap() > settings.last_run.unwrap());

        assert!(s.stop().unwrap());
        assert!(!s.is_armed());
        assert!(s.settings().unwrap().next_run.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_interval_waits_for_restart() {
        let s = scheduler(SchedulerConfig::default(), true);
        s.update_settings(&SettingsUpdate {
            interval_hours: Some(1),
            ..Default::default()
        })
        .unwrap();
        assert!(s.start().unwrap());

        s.update_settings(&SettingsUpdate {
            interval_hours: Some(3),
            ..Default::default()
        })
        .unwrap();
        s.reconcile().unwrap();

        tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
        assert_eq!(jobs_of_type(&s, "scheduler_incremental"), 1);
        let settings = s.settings().unwrap();
        assert_eq!(settings.interval_hours, 3);
        assert_eq!(
            settings.next_run.unwrap() - settings.last_run.unwrap(),
            chrono::Duration::hours(1)
        );

        tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
        assert_eq!(jobs_of_type(&s, "scheduler_incremental"), 2);

        assert!(s.stop().unwrap());
        let before = Utc::now();
        assert!(s.start().unwrap());
        let next = s.settings().unwrap().next_run.unwrap();
        assert!(next >= before + chrono::Duration::hours(3));
    }

    #[tokio::test]
    async fn test_submit_only_scheduler_never_arms() {
        let s = scheduler(SchedulerConfig::default(), false);
        assert!(s.start().unwrap());
        assert!(!s.is_armed());
        assert!(s.settings().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_run_now_while_busy_enqueues_by_default() {
        let s = scheduler(SchedulerConfig::default(), true);
        let first = s.run_now().unwrap();
        assert!(!first.already_running);
        assert_eq!(first.job.job_type, JobType::FullSync);

        let second = s.run_now().unwrap();
        assert!(second.already_running);
        let store = s.inner.queue.store();
        assert_eq!(store.get(&second.job.id).unwrap().unwrap().status, JobStatus::Pending);
        store.cancel(&first.job.id).unwrap();
        store.cancel(&second.job.id).unwrap();
    }

    #[tokio::test]
    async fn test_run_now_rejects_when_configured() {
        let config = SchedulerConfig {
            run_now_when_busy: RunNowPolicy::Reject,
            ..Default::default()
        };
        let s = scheduler(config, true);
        let first = s.run_now().unwrap();
        let err = s.run_now().unwrap_err();
        assert!(matches!(err, VidsyncError::Conflict(_)));
        assert_eq!(jobs_of_type(&s, "full_sync"), 1);
        s.inner.queue.store().cancel(&first.job.id).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_follows_persisted_state() {
        let s = scheduler(SchedulerConfig::default(), true);
        // Another process activates the schedule.
        let mut settings = s.settings().unwrap();
        settings.is_active = true;
        settings.next_run = Some(Utc::now() + chrono::Duration::hours(6));
        s.save(&settings).unwrap();

        assert!(!s.is_armed());
        s.restore().unwrap();
        assert!(s.is_armed());

        settings.is_active = false;
        s.save(&settings).unwrap();
        s.reconcile().unwrap();
        assert!(!s.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_run_fires_on_restore() {
        let s = scheduler(SchedulerConfig::default(), true);
        let mut settings = s.settings().unwrap();
        settings.is_active = true;
        settings.next_run = Some(Utc::now() - chrono::Duration::hours(1));
        s.save(&settings).unwrap();

        s.restore().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(jobs_of_type(&s, "scheduler_incremental"), 1);
    }
}
