//! Runtime cache configuration.
//!
//! Built from the `[cache]` section of the settings, or assembled directly by
//! embedders that want a custom key builder.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheSettings, StoreBackend};

use super::keys::{KeyPolicy, RouteKeyPolicy};
use super::store::{CacheStore, MemoryStore, TieredStore};

/// Cache behaviour handed to the render coordinator.
#[derive(Clone)]
pub struct CacheConfig {
    /// Decides cacheability and key per request.
    pub key_policy: Arc<dyn KeyPolicy>,
    /// Application version guarding the store contents.
    pub version: Option<String>,
    /// Expiry applied to stored pages; `None` keeps them until evicted.
    pub entry_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    /// Caching disabled: every request bypasses the store.
    fn default() -> Self {
        Self::new(RouteKeyPolicy::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        let policy = RouteKeyPolicy::new(settings.patterns.clone())
            .with_host_prefix(settings.use_host_prefix);
        Self {
            key_policy: Arc::new(policy),
            version: settings.version.clone(),
            entry_ttl: settings.entry_ttl,
        }
    }
}

impl CacheConfig {
    pub fn new(key_policy: impl KeyPolicy + 'static) -> Self {
        Self {
            key_policy: Arc::new(key_policy),
            version: None,
            entry_ttl: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("version", &self.version)
            .field("entry_ttl", &self.entry_ttl)
            .finish_non_exhaustive()
    }
}

/// Instantiate the configured store backend.
///
/// Tiered stores back-fill with the entry TTL when a tier cannot report the
/// remaining lifetime of a hit.
pub fn build_store(settings: &CacheSettings) -> Arc<dyn CacheStore> {
    match &settings.store.backend {
        StoreBackend::Memory { capacity } => Arc::new(MemoryStore::new(*capacity)),
        StoreBackend::Tiered { tiers } => {
            let tiers = tiers
                .iter()
                .map(|capacity| Arc::new(MemoryStore::new(*capacity)) as Arc<dyn CacheStore>)
                .collect();
            Arc::new(TieredStore::new(tiers).with_backfill_ttl(settings.entry_ttl))
        }
    }
}
