//! Process-wide TTL + LRU cache with regex invalidation.
//!
//! Entries expire `ttl` after they were written and are evicted
//! least-recently-accessed first once `max_entries` is reached. A background
//! sweep removes expired entries that are never read again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CacheConfig;

/// Key prefixes for content reads that go stale when an ingestion job
/// completes.
pub const CONTENT_PREFIXES: [&str; 6] = [
    "videos:",
    "categories:",
    "tags:",
    "channels:",
    "playlists:",
    "settings:",
];

struct CacheEntry<V> {
    data: V,
    timestamp: Instant,
    written_at: DateTime<Utc>,
    ttl: Duration,
    hits: u64,
    /// `lastAccessed` as a strictly increasing counter, so two accesses
    /// never tie when picking the LRU victim.
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > self.ttl
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    enabled: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn tick(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions += 1;
                log::debug!("Cache evicted least recently used key '{}'", key);
                true
            }
            None => false,
        }
    }
}

/// Observability snapshot returned by [`Cache::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_entry: Option<DateTime<Utc>>,
    /// Keys plus JSON-encoded values, in bytes.
    pub approx_memory_bytes: usize,
}

/// Thread-safe TTL + LRU cache. Cloning shares the same store.
#[derive(Clone)]
pub struct Cache<V = serde_json::Value> {
    state: Arc<Mutex<CacheState<V>>>,
    max_entries: usize,
    default_ttl: Duration,
}

impl<V> Cache<V>
where
    V: Clone + Serialize + Send + 'static,
{
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                enabled: true,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                next_seq: 0,
            })),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::new(
            config.max_entries,
            Duration::from_secs(config.default_ttl_secs),
        );
        cache.set_enabled(config.enabled);
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Stores `data` under `key`. `ttl` defaults to the configured TTL.
    pub fn set(&self, key: impl Into<String>, data: V, ttl: Option<Duration>) {
        let key = key.into();
        let mut state = self.lock();
        if !state.enabled {
            return;
        }

        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.max_entries {
                if !state.evict_lru() {
                    break;
                }
            }
        }

        let now = Instant::now();
        let access_seq = state.tick();
        state.entries.insert(
            key,
            CacheEntry {
                data,
                timestamp: now,
                written_at: Utc::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hits: 0,
                access_seq,
            },
        );
    }

    /// Returns a fresh value, or `None` after removing an expired one.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.lock();
        if !state.enabled {
            state.misses += 1;
            return None;
        }

        let now = Instant::now();
        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let access_seq = state.tick();
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.hits += 1;
        entry.access_seq = access_seq;
        Some(entry.data.clone())
    }

    /// Per-entry hit count, for diagnostics.
    pub fn entry_hits(&self, key: &str) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.hits)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Removes every key matching `pattern`. Returns the number removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !pattern.is_match(key));
        let removed = before - state.entries.len();
        if removed > 0 {
            log::debug!("Cache invalidated {} keys matching /{}/", removed, pattern);
        }
        removed
    }

    /// Drops every content-read key. Called when an ingestion job completes.
    pub fn invalidate_content(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|key, _| !CONTENT_PREFIXES.iter().any(|p| key.starts_with(p)));
        before - state.entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Disabling clears the store; `set` becomes a no-op and `get` misses.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.enabled = enabled;
        if !enabled {
            state.entries.clear();
        }
        log::info!("Cache {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Removes every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - state.entries.len();
        state.expirations += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let approx_memory_bytes = state
            .entries
            .iter()
            .map(|(k, e)| k.len() + serde_json::to_vec(&e.data).map(|v| v.len()).unwrap_or(0))
            .sum();

        CacheStats {
            enabled: state.enabled,
            size: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            expirations: state.expirations,
            oldest_entry: state.entries.values().map(|e| e.written_at).min(),
            newest_entry: state.entries.values().map(|e| e.written_at).max(),
            approx_memory_bytes,
        }
    }

    /// Spawns the periodic expiry sweep on the current tokio runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    log::debug!("Cache sweep removed {} expired entries", removed);
                }
            }
        })
    }
}
