//! Cache store contract and bundled backends.
//!
//! The coordinator only needs async get/set/reset; eviction and persistence
//! belong to the backend. Two backends ship with the crate: a bounded
//! in-memory LRU and a tiered composite over other stores.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tracing::warn;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_EVICT: &str = "render_cache_evict_total";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache backend `{backend}` failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    #[error("cache backend `{0}` is unavailable")]
    Unavailable(&'static str),
}

impl StoreError {
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }
}

/// Async key-value store holding serialized render results.
///
/// `ttl = None` keeps the entry until it is evicted or the store is reset.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Like [`get`](Self::get), also reporting how long the entry has left.
    ///
    /// A `None` lifetime means the backend knows of no expiry for the entry.
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, StoreError> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Drop every entry.
    async fn reset(&self) -> Result<(), StoreError>;
}

struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// Bounded in-process store with LRU eviction and optional per-entry expiry.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, expired ones included until next touched.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "memory_get");
        match entries.get(key) {
            None => return Ok(None),
            Some(stored) if !stored.is_expired(now) => {
                return Ok(Some((stored.value.clone(), stored.remaining(now))));
            }
            Some(_) => {}
        }
        entries.pop(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        // A deadline past what `Instant` can represent never expires.
        let stored = StoredValue {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        let evicted = rw_write(&self.entries, SOURCE, "memory_set").push(key.to_string(), stored);
        if evicted.is_some_and(|(evicted_key, _)| evicted_key != key) {
            counter!(METRIC_EVICT).increment(1);
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "memory_reset").clear();
        Ok(())
    }
}

/// Ordered stack of stores, fastest first.
///
/// Reads stop at the first tier holding the key and copy the value into the
/// tiers above it, keeping the lifetime the answering tier reports. Writes and
/// resets go to every tier; the first failure is reported after all tiers
/// were attempted.
pub struct TieredStore {
    tiers: Vec<Arc<dyn CacheStore>>,
    backfill_ttl: Option<Duration>,
}

impl TieredStore {
    pub fn new(tiers: Vec<Arc<dyn CacheStore>>) -> Self {
        Self {
            tiers,
            backfill_ttl: None,
        }
    }

    /// Expiry for back-filled copies when the answering tier reports none.
    pub fn with_backfill_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.backfill_ttl = ttl;
        self
    }

    pub fn tiers(&self) -> &[Arc<dyn CacheStore>] {
        &self.tiers
    }
}

#[async_trait]
impl CacheStore for TieredStore {
    fn name(&self) -> &'static str {
        "tiered"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, StoreError> {
        let mut answered = false;
        let mut last_error = None;

        for (position, tier) in self.tiers.iter().enumerate() {
            match tier.get_with_ttl(key).await {
                Ok(Some((value, remaining))) => {
                    let ttl = remaining.or(self.backfill_ttl);
                    for upper in &self.tiers[..position] {
                        if let Err(err) = upper.set(key, value.clone(), ttl).await {
                            warn!(tier = upper.name(), cache.key = %key, error = %err, "cache back-fill failed");
                        }
                    }
                    return Ok(Some((value, ttl)));
                }
                Ok(None) => answered = true,
                Err(err) => {
                    warn!(tier = tier.name(), cache.key = %key, error = %err, "cache tier read failed");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut first_error = None;
        for tier in &self.tiers {
            if let Err(err) = tier.set(key, value.clone(), ttl).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for tier in &self.tiers {
            if let Err(err) = tier.reset().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
