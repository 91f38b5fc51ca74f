pub mod loader;
pub mod schema;

pub use loader::{is_valid_timezone, load_config, load_config_from_str, validate_config};
pub use schema::{
    AppConfig, CacheConfig, DatabaseConfig, EventLogConfig, LogFormat, LoggingConfig,
    QueueConfig, RunNowPolicy, ScraperConfig, SchedulerConfig, StreamConfig,
};
