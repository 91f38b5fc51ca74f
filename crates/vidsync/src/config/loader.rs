use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::schema::AppConfig;
use crate::error::ConfigError;

static RE_TIMEZONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:UTC|GMT|[A-Za-z]+(?:/[A-Za-z0-9_+\-]+){1,2}|(?:UTC|GMT)[+-](?:0?\d|1[0-4])(?::[0-5]\d)?)$")
        .unwrap()
});

/// Accepts `UTC`, `GMT`, IANA-style names (`Europe/Zurich`) and fixed offsets
/// (`UTC+2`, `GMT-03:30`).
pub fn is_valid_timezone(tz: &str) -> bool {
    RE_TIMEZONE.is_match(tz)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    let cache = &config.cache;
    if cache.max_entries == 0 {
        return Err(invalid("cache.maxEntries must be at least 1"));
    }
    if cache.default_ttl_secs == 0 {
        return Err(invalid("cache.defaultTtlSecs must be at least 1"));
    }
    if cache.sweep_interval_secs == 0 {
        return Err(invalid("cache.sweepIntervalSecs must be at least 1"));
    }

    if config.queue.poll_interval_secs == 0 {
        return Err(invalid("queue.pollIntervalSecs must be at least 1"));
    }

    let scheduler = &config.scheduler;
    if !(1..=24).contains(&scheduler.default_interval_hours) {
        return Err(invalid(format!(
            "scheduler.defaultIntervalHours must be between 1 and 24, got {}",
            scheduler.default_interval_hours
        )));
    }
    if !is_valid_timezone(&scheduler.default_timezone) {
        return Err(invalid(format!(
            "scheduler.defaultTimezone '{}' is not a recognised timezone",
            scheduler.default_timezone
        )));
    }

    let stream = &config.stream;
    if stream.poll_interval_ms == 0 {
        return Err(invalid("stream.pollIntervalMs must be at least 1"));
    }
    if stream.heartbeat_secs == 0 {
        return Err(invalid("stream.heartbeatSecs must be at least 1"));
    }
    if stream.initial_log_limit == 0 {
        return Err(invalid("stream.initialLogLimit must be at least 1"));
    }
    if stream.max_consecutive_errors == 0 {
        return Err(invalid("stream.maxConsecutiveErrors must be at least 1"));
    }

    if let Some(ref scraper) = config.scraper {
        if scraper.command.trim().is_empty() {
            return Err(invalid("scraper.command must not be empty"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_valid_config() {
        let config_json = r#"
        {
            "database": { "path": "/tmp/vidsync-test.db" },
            "cache": { "maxEntries": 100, "defaultTtlSecs": 60 },
            "scheduler": { "defaultIntervalHours": 12, "defaultTimezone": "Europe/Zurich" },
            "scraper": { "command": "yt-ingest", "args": ["--json"], "env": { "API_KEY": "x" } },
            "logging": { "level": "debug", "format": "json" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.scheduler.default_timezone, "Europe/Zurich");
        let scraper = config.scraper.unwrap();
        assert_eq!(scraper.command, "yt-ingest");
        assert_eq!(scraper.env.get("API_KEY").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"queue": {{"pollIntervalSecs": 2}}}}"#).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.queue.poll_interval_secs, 2);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/vidsync.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let err = load_config_from_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseJson(_)));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        for bad in [
            r#"{"cache": {"maxEntries": 0}}"#,
            r#"{"cache": {"sweepIntervalSecs": 0}}"#,
            r#"{"scheduler": {"defaultIntervalHours": 25}}"#,
            r#"{"scheduler": {"defaultIntervalHours": 0}}"#,
            r#"{"scheduler": {"defaultTimezone": "not a zone"}}"#,
            r#"{"stream": {"initialLogLimit": 0}}"#,
            r#"{"stream": {"heartbeatSecs": 0}}"#,
            r#"{"scraper": {"command": "  "}}"#,
        ] {
            let err = load_config_from_str(bad).unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation { .. }),
                "expected validation error for {}",
                bad
            );
        }
    }

    #[test]
    fn test_timezone_patterns() {
        for tz in [
            "UTC",
            "GMT",
            "Europe/Zurich",
            "America/Argentina/Buenos_Aires",
            "UTC+2",
            "GMT-03:30",
        ] {
            assert!(is_valid_timezone(tz), "{} should be accepted", tz);
        }
        for tz in ["", "utc+99", "Europe/", "/Zurich", "UTC+15", "Mars Time"] {
            assert!(!is_valid_timezone(tz), "{} should be rejected", tz);
        }
    }
}
