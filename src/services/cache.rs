//! src/services/cache.rs
//!
//! Bounded recency cache for served bodies (raw, transformed or zipped).
//!
//! Size is capped at insert time by evicting the single least recently
//! accessed entry. Entries idle for longer than the TTL are dropped by a
//! periodic sweep task that lives until its cancellation token fires.

use crate::models::{stored::StoredContent, transform::TransformRequest};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the expiry sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CacheEntry {
    name: String,
    mod_time: DateTime<Utc>,
    content: Bytes,
    last_access: Instant,
}

#[derive(Debug)]
pub struct RecencyCache {
    max_count: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RecencyCache {
    /// Create a cache without a sweep task. `max_count == 0` disables it.
    pub fn new(max_count: usize, ttl: Duration) -> Self {
        Self {
            max_count,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a cache and, when enabled, start its expiry sweep on the
    /// current runtime. The sweep stops when `cancel` fires or the cache is
    /// dropped.
    pub fn spawn(
        max_count: usize,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (Arc<Self>, Option<tokio::task::JoinHandle<()>>) {
        let cache = Arc::new(Self::new(max_count, ttl));
        if !cache.is_enabled() {
            return (cache, None);
        }

        let weak = Arc::downgrade(&cache);
        let handle = tokio::spawn(sweep_loop(weak, interval, cancel));
        (cache, Some(handle))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_count > 0
    }

    /// Fingerprint of a retrieve request.
    ///
    /// The path is length-prefixed so its content cannot run into the
    /// parameter encoding that follows it.
    pub fn generate_key(path: &str, params: &TransformRequest, download: bool) -> String {
        format!(
            "{}:{}|{}|dl={}",
            path.len(),
            path,
            params.canonical(),
            u8::from(download)
        )
    }

    /// Look up `key`, refreshing its access time on a hit.
    pub fn get_and_refresh(&self, key: &str) -> Option<StoredContent> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(StoredContent {
            name: entry.name.clone(),
            mod_time: entry.mod_time,
            content: entry.content.clone(),
        })
    }

    pub fn set(&self, key: &str, name: &str, mod_time: DateTime<Utc>, content: Bytes) {
        if !self.is_enabled() {
            return;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            entry.name = name.to_owned();
            entry.mod_time = mod_time;
            entry.content = content;
            entry.last_access = now;
            return;
        }

        entries.insert(
            key.to_owned(),
            CacheEntry {
                name: name.to_owned(),
                mod_time,
                content,
                last_access: now,
            },
        );

        if entries.len() > self.max_count {
            // Linear scan; max_count is small by configuration.
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose `last_access + ttl` is before `now`.
    /// Returns the number of entries removed.
    ///
    /// A TTL too large to represent as an `Instant` never expires.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .last_access
                .checked_add(self.ttl)
                .is_none_or(|deadline| deadline >= now)
        });
        before - entries.len()
    }
}

async fn sweep_loop(cache: Weak<RecencyCache>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(cache) = cache.upgrade() else {
            break;
        };
        let removed = cache.remove_expired(Instant::now());
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "cache sweep evicted idle entries");
        }
    }
}
