//! Retention-bounded, deduplicated log of execution and infrastructure errors.

use std::sync::LazyLock;

use chrono::{Duration, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::db::event_repo::{self, EventRow};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::jobs::LogLevel;

static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});
static RE_HEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{12,}\b").unwrap());
static RE_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static RE_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Collapses ids, digits and whitespace so repeats of the same error
/// share a fingerprint.
pub fn normalize_message(message: &str) -> String {
    let s = RE_UUID.replace_all(message, "<id>");
    let s = RE_HEX.replace_all(&s, "<id>");
    let s = RE_DIGITS.replace_all(&s, "<n>");
    RE_SPACES.replace_all(s.trim(), " ").to_lowercase()
}

/// Stable 16-hex-char fingerprint over the source and normalized message.
pub fn fingerprint(source: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_message(message).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[derive(Clone)]
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records one occurrence and returns its fingerprint.
    pub fn record(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        job_id: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let fp = fingerprint(source, message);
        event_repo::record(
            &self.db,
            &fp,
            level.as_str(),
            source,
            message,
            job_id,
            &format_timestamp(Utc::now()),
        )?;
        Ok(fp)
    }

    /// Like [`record`](Self::record), but only logs a failure to persist.
    pub fn record_quietly(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        job_id: Option<&str>,
    ) {
        if let Err(e) = self.record(level, source, message, job_id) {
            log::error!("Failed to record {} event '{}': {}", source, message, e);
        }
    }

    pub fn recent(&self, limit: u64) -> Result<Vec<EventRow>, DatabaseError> {
        event_repo::recent(&self.db, limit)
    }

    /// Deletes events not seen within the last `retention_days` days.
    pub fn prune(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let removed = event_repo::prune_before(&self.db, &format_timestamp(cutoff))?;
        if removed > 0 {
            log::info!("Pruned {} events older than {} days", removed, retention_days);
        }
        Ok(removed)
    }
}
