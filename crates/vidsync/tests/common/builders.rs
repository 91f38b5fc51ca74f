//! Builder for test configurations.

#![allow(dead_code)]

use vidsync::config::{AppConfig, RunNowPolicy};

/// Builder for `AppConfig` instances with fast timings for tests.
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.stream.poll_interval_ms = 20;
        config.queue.poll_interval_secs = 1;
        Self { config }
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache.default_ttl_secs = secs;
        self
    }

    pub fn cache_max_entries(mut self, max: usize) -> Self {
        self.config.cache.max_entries = max;
        self
    }

    pub fn stream_poll_ms(mut self, ms: u64) -> Self {
        self.config.stream.poll_interval_ms = ms;
        self
    }

    pub fn initial_log_limit(mut self, limit: u64) -> Self {
        self.config.stream.initial_log_limit = limit;
        self
    }

    pub fn default_interval_hours(mut self, hours: u32) -> Self {
        self.config.scheduler.default_interval_hours = hours;
        self
    }

    pub fn run_now_when_busy(mut self, policy: RunNowPolicy) -> Self {
        self.config.scheduler.run_now_when_busy = policy;
        self
    }

    pub fn max_logs_per_job(mut self, max: u64) -> Self {
        self.config.queue.max_logs_per_job = max;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
