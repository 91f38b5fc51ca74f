pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod event_log;
pub mod jobs;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod telemetry;

pub use app::{App, BackgroundTasks};
pub use cache::{Cache, CacheStats};
pub use config::{load_config, load_config_from_str, AppConfig};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, Result, VidsyncError};
pub use event_log::EventLog;
pub use jobs::{
    ControlOutcome, Job, JobProgress, JobStatus, JobStore, JobType, LogEntry, LogLevel,
};
pub use queue::{CommandScraper, JobQueue, JobReporter, ScrapeError, ScrapeUnit};
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerStatus, SettingsUpdate};
pub use stream::{JobStream, StreamEvent, StreamTarget};
