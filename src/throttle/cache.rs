//! Throttle state cache.
//!
//! Holds the last known throttle status per key as reported by the rate
//! authority. Reads come from rule pipelines, writes from the sync client.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Result, TollgateError};

/// One row of throttle state, as loaded at bootstrap or pushed by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleEntry {
    pub key: String,
    pub throttled: bool,
}

impl ThrottleEntry {
    pub fn new(key: impl Into<String>, throttled: bool) -> Self {
        Self {
            key: key.into(),
            throttled,
        }
    }
}

/// Concurrent key -> throttled map with a readiness gate.
///
/// Updates are last-write-wins per key. Writes to a key are serialized by the
/// shard lock, so they apply in arrival order.
pub struct ThrottleStateCache {
    entries: DashMap<String, bool>,
    ready: watch::Sender<bool>,
    /// Claimed by the first `bootstrap` call
    bootstrapped: AtomicBool,
}

impl std::fmt::Debug for ThrottleStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleStateCache")
            .field("entries", &self.entries.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ThrottleStateCache {
    /// Create an empty cache that is not yet ready.
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            entries: DashMap::new(),
            ready,
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// Whether `key` is currently throttled. Unknown keys are not throttled.
    pub fn get(&self, key: &str) -> bool {
        self.entries.get(key).map(|v| *v).unwrap_or(false)
    }

    /// Record the throttle status of `key`, replacing any previous value.
    pub fn put(&self, key: impl Into<String>, throttled: bool) {
        let key = key.into();
        debug!(key = %key, throttled, "Updating throttle state");
        self.entries.insert(key, throttled);
    }

    /// Bulk-load persisted state and open the readiness gate.
    ///
    /// Must run at most once, before any decision is served.
    pub fn bootstrap<I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = ThrottleEntry>,
    {
        if self.bootstrapped.swap(true, Ordering::AcqRel) || self.is_ready() {
            return Err(TollgateError::InternalInvariant(
                "throttle cache already bootstrapped".to_string(),
            ));
        }

        let mut loaded = 0;
        for entry in entries {
            self.entries.insert(entry.key, entry.throttled);
            loaded += 1;
        }

        info!(entries = loaded, "Throttle cache bootstrapped");
        self.mark_ready();
        Ok(loaded)
    }

    /// Open the readiness gate without loading anything.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the cache is ready to serve decisions.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this only fails if it is dropped.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ThrottleStateCache {
    fn default() -> Self {
        Self::new()
    }
}
