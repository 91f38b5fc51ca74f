//! Process-level wiring of the store, cache, queue and scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::db::{default_database_path, Database};
use crate::error::{Result, VidsyncError};
use crate::event_log::EventLog;
use crate::jobs::JobStore;
use crate::queue::{CommandScraper, JobQueue, ScrapeUnit};
use crate::scheduler::Scheduler;
use crate::stream::{JobStream, StreamTarget};

/// How often old event-log rows are pruned.
const EVENT_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared handles for one process. Cloning is cheap.
#[derive(Clone)]
pub struct App {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub store: JobStore,
    pub cache: Cache,
    pub events: EventLog,
    pub queue: JobQueue,
    pub scheduler: Scheduler,
}

impl App {
    /// Opens the configured database. The process executes jobs only when a
    /// scraper command is configured.
    pub fn open(config: AppConfig) -> Result<Self> {
        let scraper: Option<Arc<dyn ScrapeUnit>> = config
            .scraper
            .clone()
            .map(|c| Arc::new(CommandScraper::new(c)) as Arc<dyn ScrapeUnit>);
        let db = Database::open(&resolve_database_path(&config)?)?;
        Ok(Self::assemble(config, db, scraper))
    }

    /// Opens the configured database without executing anything, for
    /// processes that only submit and inspect jobs.
    pub fn open_client(config: AppConfig) -> Result<Self> {
        let db = Database::open(&resolve_database_path(&config)?)?;
        Ok(Self::assemble(config, db, None))
    }

    /// Builds an executing app around an already-open database.
    pub fn with_scraper(config: AppConfig, db: Database, scraper: Arc<dyn ScrapeUnit>) -> Self {
        Self::assemble(config, db, Some(scraper))
    }

    /// Builds a submit-only app around an already-open database.
    pub fn submit_only(config: AppConfig, db: Database) -> Self {
        Self::assemble(config, db, None)
    }

    fn assemble(config: AppConfig, db: Database, scraper: Option<Arc<dyn ScrapeUnit>>) -> Self {
        let store = JobStore::new(db.clone());
        let cache = Cache::from_config(&config.cache);
        let events = EventLog::new(db.clone());
        let queue = match scraper {
            Some(scraper) => JobQueue::new(
                store.clone(),
                cache.clone(),
                events.clone(),
                scraper,
                config.queue.max_logs_per_job,
            ),
            None => JobQueue::submit_only(store.clone(), cache.clone(), events.clone()),
        };
        let scheduler = Scheduler::new(db.clone(), queue.clone(), config.scheduler.clone());

        Self {
            config: Arc::new(config),
            db,
            store,
            cache,
            events,
            queue,
            scheduler,
        }
    }

    /// Restart recovery, then the periodic background loops. Must be called
    /// inside a tokio runtime. Dropping the guard stops the loops.
    pub fn start_background(&self) -> Result<BackgroundTasks> {
        let mut tasks = BackgroundTasks::default();

        if self.queue.is_executor() {
            if self.config.queue.recover_interrupted_on_start {
                let recovered = self.store.recover_interrupted()?;
                if !recovered.is_empty() {
                    warn!(
                        "Marked {} interrupted job(s) as failed: {}",
                        recovered.len(),
                        recovered.join(", ")
                    );
                }
            }
            self.scheduler.restore()?;
            self.queue.process_queue()?;
            tasks.push(self.spawn_queue_poller());
        } else {
            info!("No scraper configured: running submit-only, jobs execute elsewhere");
        }

        // Runs even while disabled: the cache can be switched on later.
        let every = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        tasks.push(self.cache.spawn_sweeper(every));
        tasks.push(self.spawn_event_pruner());

        Ok(tasks)
    }

    /// Picks up jobs submitted by other processes and follows scheduler
    /// changes made elsewhere.
    fn spawn_queue_poller(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let scheduler = self.scheduler.clone();
        let every = Duration::from_secs(self.config.queue.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.process_queue() {
                    Ok(Some(job)) => debug!("Queue poll started job {}", job.id),
                    Ok(None) => {}
                    Err(e) => error!("Queue poll failed: {}", e),
                }
                if let Err(e) = scheduler.reconcile() {
                    error!("Scheduler reconcile failed: {}", e);
                }
            }
        })
    }

    fn spawn_event_pruner(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let retention_days = self.config.event_log.retention_days;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVENT_PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                match events.prune(retention_days) {
                    Ok(0) => {}
                    Ok(n) => debug!(
                        "Pruned {} event log rows older than {} days",
                        n, retention_days
                    ),
                    Err(e) => warn!("Failed to prune event log: {}", e),
                }
            }
        })
    }

    /// Opens a live stream for one viewer.
    pub fn stream(&self, target: StreamTarget) -> JobStream {
        JobStream::spawn(
            self.store.clone(),
            Some(self.events.clone()),
            target,
            &self.config.stream,
        )
    }
}

fn resolve_database_path(config: &AppConfig) -> Result<PathBuf> {
    match config.database.path.clone() {
        Some(path) => Ok(path),
        None => default_database_path().ok_or_else(|| {
            VidsyncError::invalid("could not determine a home directory; set database.path")
        }),
    }
}

/// Handles of the loops started by [`App::start_background`].
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(mut self) {
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        debug!("Stopped {} background task(s)", count);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}
