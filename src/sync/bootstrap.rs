//! Seeding the throttle state cache at startup.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::throttle::{ThrottleEntry, ThrottleStateCache};

/// A read-only supplier of persisted throttle state.
#[async_trait]
pub trait BootstrapSource: Send + Sync {
    async fn load(&self) -> Result<Vec<ThrottleEntry>>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Reads a JSON array of `{"key": ..., "throttled": ...}` rows.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BootstrapSource for JsonFileSource {
    async fn load(&self) -> Result<Vec<ThrottleEntry>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            TollgateError::Transport(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            TollgateError::Transport(format!("cannot parse {}: {}", self.path.display(), e))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Fixed in-memory entries.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    entries: Vec<ThrottleEntry>,
}

impl StaticSource {
    pub fn new(entries: Vec<ThrottleEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl BootstrapSource for StaticSource {
    async fn load(&self) -> Result<Vec<ThrottleEntry>> {
        Ok(self.entries.clone())
    }

    fn describe(&self) -> String {
        format!("static ({} entries)", self.entries.len())
    }
}

/// Load `source` into `cache` and open the cache's readiness gate.
///
/// An unavailable source is not fatal: decisions start from an empty cache.
pub async fn bootstrap_cache(
    cache: &ThrottleStateCache,
    source: Option<&dyn BootstrapSource>,
) -> usize {
    let Some(source) = source else {
        info!("No bootstrap source configured, starting with empty throttle state");
        cache.mark_ready();
        return 0;
    };

    let loaded = match source.load().await {
        Ok(entries) => cache.bootstrap(entries),
        Err(err) => Err(err),
    };

    match loaded {
        Ok(count) => {
            info!(source = %source.describe(), entries = count, "Bootstrap complete");
            count
        }
        Err(err) => {
            warn!(
                source = %source.describe(),
                error = %err,
                "Bootstrap source unavailable, continuing with current throttle state"
            );
            cache.mark_ready();
            0
        }
    }
}
