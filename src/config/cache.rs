//! TTL cache over the agent's config fetches

use crate::client::ConfigFetcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why no config is available
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("config has not been fetched yet")]
    NotFetched,

    #[error("fetching config: {0:#}")]
    Fetch(Arc<anyhow::Error>),
}

/// Outcome of the last refresh and when it happened
///
/// A failed refresh stores only its error; the previous config is dropped
/// rather than served stale.
pub struct ConfigCacheEntry<C> {
    result: Result<Arc<C>, ConfigError>,
    last_updated: Option<Instant>,
}

impl<C> ConfigCacheEntry<C> {
    pub fn new(result: Result<Arc<C>, ConfigError>, last_updated: Instant) -> Self {
        Self {
            result,
            last_updated: Some(last_updated),
        }
    }

    pub fn config(&self) -> Option<&Arc<C>> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ConfigError> {
        self.result.as_ref().err()
    }

    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        match self.last_updated {
            Some(at) => now.saturating_duration_since(at) < ttl,
            None => false,
        }
    }
}

impl<C> Default for ConfigCacheEntry<C> {
    fn default() -> Self {
        Self {
            result: Err(ConfigError::NotFetched),
            last_updated: None,
        }
    }
}

impl<C> Clone for ConfigCacheEntry<C> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Serves the last fetched config for `ttl`, then refreshes
///
/// The entry lock is held across a refresh, so concurrent callers of a
/// stale cache share one fetch.
pub struct ConfigCache<C> {
    fetcher: Arc<dyn ConfigFetcher<C>>,
    ttl: Duration,
    entry: Mutex<ConfigCacheEntry<C>>,
    refreshes: AtomicU64,
}

impl<C: Send + Sync + 'static> ConfigCache<C> {
    pub fn new(fetcher: Arc<dyn ConfigFetcher<C>>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            entry: Mutex::new(ConfigCacheEntry::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// The cached config or cached error while fresh, otherwise a refresh
    pub async fn get_config(&self) -> Result<Arc<C>, ConfigError> {
        let mut entry = self.entry.lock().await;
        if entry.is_fresh(self.ttl, Instant::now()) {
            return entry.result.clone();
        }
        self.refresh_locked(&mut entry).await
    }

    /// Refresh now, regardless of freshness
    pub async fn refresh(&self) -> Result<Arc<C>, ConfigError> {
        let mut entry = self.entry.lock().await;
        self.refresh_locked(&mut entry).await
    }

    /// Snapshot of the current entry
    pub async fn entry(&self) -> ConfigCacheEntry<C> {
        self.entry.lock().await.clone()
    }

    /// Replace the entry wholesale
    pub async fn set_entry(&self, entry: ConfigCacheEntry<C>) {
        *self.entry.lock().await = entry;
    }

    /// Number of fetches performed so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn refresh_locked(&self, entry: &mut ConfigCacheEntry<C>) -> Result<Arc<C>, ConfigError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let result = match self.fetcher.fetch_config().await {
            Ok(config) => {
                debug!("Config refreshed");
                Ok(Arc::new(config))
            }
            Err(e) => {
                warn!("Config refresh failed: {:#}", e);
                Err(ConfigError::Fetch(Arc::new(e)))
            }
        };

        *entry = ConfigCacheEntry::new(result.clone(), Instant::now());
        result
    }
}
