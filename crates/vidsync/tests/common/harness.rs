//! Test harness for isolated queue and stream execution.
//!
//! The `TestHarness` owns a temp directory holding the database and an
//! executing `App` whose scraping unit is a `ScriptedScraper`.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use vidsync::config::AppConfig;
use vidsync::queue::{JobReporter, ScrapeError, ScrapeUnit};
use vidsync::{App, Database, Job, JobStatus};

use super::builders::ConfigBuilder;

/// One action of a scripted scraping run.
#[derive(Debug, Clone)]
pub enum Step {
    Log(&'static str),
    VideosAdded(u64),
    ItemFailed(&'static str),
    /// Blocks until `ScriptedScraper::release` is called or the job is
    /// cancelled.
    WaitForRelease,
    Fail(&'static str),
    Panic,
}

/// Scraping unit that replays the same steps for every job it runs.
pub struct ScriptedScraper {
    steps: Vec<Step>,
    release: Notify,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedScraper {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            release: Notify::new(),
            started: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Lets one waiting (or the next) `WaitForRelease` step continue.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Job ids in the order their runs began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Highest number of runs ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run_steps(&self, reporter: &JobReporter) -> Result<(), ScrapeError> {
        for step in &self.steps {
            if reporter.is_cancelled() {
                return Err(ScrapeError::Cancelled);
            }
            match step {
                Step::Log(message) => reporter.log(vidsync::LogLevel::Info, *message),
                Step::VideosAdded(n) => reporter.videos_added(*n),
                Step::ItemFailed(message) => {
                    reporter.item_failed(Some(("UC-test", "Test Channel")), *message)
                }
                Step::WaitForRelease => loop {
                    tokio::select! {
                        _ = self.release.notified() => break,
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {
                            if reporter.is_cancelled() {
                                return Err(ScrapeError::Cancelled);
                            }
                        }
                    }
                },
                Step::Fail(message) => return Err(ScrapeError::Failed(message.to_string())),
                Step::Panic => panic!("scripted panic"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScrapeUnit for ScriptedScraper {
    async fn run(&self, job: &Job, reporter: &JobReporter) -> Result<(), ScrapeError> {
        self.started.lock().unwrap().push(job.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.run_steps(reporter).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Isolated executing app over a temp-dir database.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub app: App,
    pub scraper: Arc<ScriptedScraper>,
}

impl TestHarness {
    pub fn new(steps: Vec<Step>) -> Self {
        Self::with_config(ConfigBuilder::new().build(), steps)
    }

    pub fn with_config(config: AppConfig, steps: Vec<Step>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("vidsync.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        let scraper = Arc::new(ScriptedScraper::new(steps));
        let app = App::with_scraper(config, db, scraper.clone());
        Self {
            temp_dir,
            db_path,
            app,
            scraper,
        }
    }

    /// A second, submit-only process sharing this harness's database.
    pub fn client(&self) -> App {
        let db = Database::open(&self.db_path).expect("Failed to open database");
        App::submit_only((*self.app.config).clone(), db)
    }

    pub fn status(&self, id: &str) -> JobStatus {
        self.app.store.get(id).unwrap().expect("job exists").status
    }

    /// Polls until the job reaches `status`, panicking after five seconds.
    pub async fn wait_for_status(&self, id: &str, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.app.store.get(id).unwrap().expect("job exists");
            if job.status == status {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {} stuck in {} waiting for {}", id, job.status, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Polls until `count` runs have started.
    pub async fn wait_for_started(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.scraper.started().len() < count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "only {} of {} runs started",
                    self.scraper.started().len(),
                    count
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
