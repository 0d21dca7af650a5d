//! Application-version gate for the cache store.
//!
//! Pages rendered by an older release must not be served by a newer one. On
//! startup the gate compares the configured version with the marker kept in
//! the store and resets the store when they differ. The new marker is written
//! later, from the first request, because a store reset may still be in
//! progress when the process starts serving.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::store::CacheStore;

/// Store key holding the last application version that populated the cache.
pub const VERSION_KEY: &str = "appVersion";

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const PERSISTED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No version configured; the store is left alone.
    Unversioned,
    /// The store already belongs to the current version.
    Unchanged,
    /// The store held another version (or none) and was reset.
    Reset { previous: Option<String> },
    /// The store could not be read or reset; entries may be stale.
    StoreUnavailable,
}

pub struct VersionGate {
    store: Arc<dyn CacheStore>,
    version: Option<String>,
    state: AtomicU8,
}

impl VersionGate {
    pub fn new(store: Arc<dyn CacheStore>, version: Option<String>) -> Self {
        let version = version
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self {
            store,
            version,
            state: AtomicU8::new(IDLE),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Reset the store when it was populated by another application version.
    #[instrument(skip(self), fields(version = self.version.as_deref()))]
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let Some(version) = self.version.as_deref() else {
            return ReconcileOutcome::Unversioned;
        };

        let previous = match self.store.get(VERSION_KEY).await {
            Ok(marker) => marker.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => {
                warn!(error = %err, "failed to read cache version marker");
                return ReconcileOutcome::StoreUnavailable;
            }
        };

        if previous.as_deref() == Some(version) {
            debug!("cache already matches application version");
            return ReconcileOutcome::Unchanged;
        }

        info!(
            from = previous.as_deref().unwrap_or("none"),
            to = version,
            "Cache updated to new application version"
        );
        if let Err(err) = self.store.reset().await {
            warn!(error = %err, "failed to reset cache after version change");
            return ReconcileOutcome::StoreUnavailable;
        }

        ReconcileOutcome::Reset { previous }
    }

    /// True while a version is configured and its marker is not yet written.
    pub fn needs_persist(&self) -> bool {
        self.version.is_some() && self.state.load(Ordering::Acquire) == IDLE
    }

    pub fn is_persisted(&self) -> bool {
        self.state.load(Ordering::Acquire) == PERSISTED
    }

    /// Write the version marker unless it was already written.
    ///
    /// Only one write is in flight at a time; a failed write lets a later
    /// call try again. Returns true when this call wrote the marker.
    pub async fn try_persist(&self) -> bool {
        let Some(version) = self.version.as_deref() else {
            return false;
        };
        if self
            .state
            .compare_exchange(IDLE, PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match self
            .store
            .set(VERSION_KEY, Bytes::from(version.to_string()), None)
            .await
        {
            Ok(()) => {
                self.state.store(PERSISTED, Ordering::Release);
                debug!(version, "stored cache version marker");
                true
            }
            Err(err) => {
                self.state.store(IDLE, Ordering::Release);
                warn!(version, error = %err, "failed to store cache version marker");
                false
            }
        }
    }
}
