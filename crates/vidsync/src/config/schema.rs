use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration. Every section has defaults, so `{}` is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub scraper: Option<ScraperConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file. Falls back to `~/.vidsync/data/vidsync.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_entries() -> usize {
    500
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// How often the daemon re-checks for jobs submitted by other processes.
    #[serde(default = "default_queue_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub recover_interrupted_on_start: bool,
    /// Log entries kept per job once it reaches a terminal state.
    #[serde(default = "default_max_logs_per_job")]
    pub max_logs_per_job: u64,
}

fn default_queue_poll_secs() -> u64 {
    5
}

fn default_max_logs_per_job() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_queue_poll_secs(),
            recover_interrupted_on_start: true,
            max_logs_per_job: default_max_logs_per_job(),
        }
    }
}

/// What `run-now` does while another job holds the running slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunNowPolicy {
    /// Queue the job behind the running one and report that it is waiting.
    #[default]
    Enqueue,
    /// Refuse with a conflict error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Interval used until an operator saves settings.
    #[serde(default = "default_interval_hours")]
    pub default_interval_hours: u32,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub run_now_when_busy: RunNowPolicy,
}

fn default_interval_hours() -> u32 {
    6
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_hours: default_interval_hours(),
            default_timezone: default_timezone(),
            run_now_when_busy: RunNowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default = "default_stream_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Entries sent in `logs_init` when a viewer connects.
    #[serde(default = "default_initial_log_limit")]
    pub initial_log_limit: u64,
    /// Consecutive failed reads after which the stream ends.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_stream_poll_ms() -> u64 {
    1000
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_initial_log_limit() -> u64 {
    200
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_stream_poll_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            initial_log_limit: default_initial_log_limit(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

/// External scraping process launched once per job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
