//! Process logging setup.
//!
//! Library code logs through the `log` macros. Installing the subscriber also
//! installs the `log` bridge, which forwards those records into a
//! `tracing-subscriber` registry that writes
//! either human-readable text or JSON lines to stderr. Stdout is left to the
//! CLI's own output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::VidsyncError;

/// Builds the filter from `RUST_LOG` when set, otherwise from the configured
/// level with a few noisy dependencies turned down.
pub fn build_env_filter(level: &str) -> Result<EnvFilter, VidsyncError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = [level, "rusqlite=warn", "tokio=warn"].join(",");
    EnvFilter::try_new(&directives).map_err(|e| {
        VidsyncError::Telemetry(format!("invalid log filter '{}': {}", directives, e))
    })
}

/// Installs the global subscriber and the `log` bridge. Fails if either is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), VidsyncError> {
    let filter = build_env_filter(&config.level)?;
    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| VidsyncError::Telemetry(e.to_string()))?;

    tracing::debug!(
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}
