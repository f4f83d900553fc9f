//! Config client: cached config fetches plus receiver fan-out
//!
//! One `ConfigClient` is built in `main` and shared by reference; it owns
//! both the cache entry and the receiver list.

mod cache;
mod receivers;

pub use cache::{ConfigCache, ConfigCacheEntry, ConfigError};
pub use receivers::{
    run_receivers, ConfigReceiver, ReceiverCancelled, ReceiverErrors, ReceiverFailure,
    ReceiverFn, ReceiverTimedOut,
};

use crate::client::ConfigFetcher;
use fleet_shared::defaults;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConfigClient<C> {
    cache: ConfigCache<C>,
    /// Append-only, in registration order
    receivers: RwLock<Vec<Arc<dyn ConfigReceiver<C>>>>,
    receiver_timeout: Duration,
}

impl<C: Send + Sync + 'static> ConfigClient<C> {
    pub fn new(fetcher: Arc<dyn ConfigFetcher<C>>, ttl: Duration) -> Self {
        Self {
            cache: ConfigCache::new(fetcher, ttl),
            receivers: RwLock::new(Vec::new()),
            receiver_timeout: Duration::from_millis(defaults::RECEIVER_TIMEOUT_MS),
        }
    }

    /// Limit how long any single receiver may run
    pub fn with_receiver_timeout(mut self, timeout: Duration) -> Self {
        self.receiver_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &ConfigCache<C> {
        &self.cache
    }

    pub async fn get_config(&self) -> Result<Arc<C>, ConfigError> {
        self.cache.get_config().await
    }

    /// Add a receiver; registering the same receiver twice runs it twice
    pub async fn register_receiver(&self, receiver: Arc<dyn ConfigReceiver<C>>) {
        info!("Registered config receiver {}", receiver.name());
        self.receivers.write().await.push(receiver);
    }

    pub async fn receiver_count(&self) -> usize {
        self.receivers.read().await.len()
    }

    /// Hand `config` to every registered receiver in order
    pub async fn run_receivers(
        &self,
        config: &C,
        cancel: &CancellationToken,
    ) -> Result<(), ReceiverErrors> {
        // Snapshot so registration is not blocked behind a slow receiver
        let receivers = self.receivers.read().await.clone();
        run_receivers(&receivers, config, self.receiver_timeout, cancel).await
    }

    /// Refresh and fan out every `period` until cancelled
    pub async fn run(&self, period: Duration, cancel: &CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let config = match self.get_config().await {
                Ok(config) => config,
                Err(e) => {
                    warn!("No config this cycle: {}", e);
                    continue;
                }
            };

            match self.run_receivers(&config, cancel).await {
                Ok(()) => debug!("Config delivered to all receivers"),
                Err(errors) => warn!("{}", errors),
            }
        }

        info!("Config refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFetcher(u32);

    #[async_trait]
    impl ConfigFetcher<u32> for FixedFetcher {
        async fn fetch_config(&self) -> Result<u32> {
            Ok(self.0)
        }
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn ConfigReceiver<u32>> {
        Arc::new(ReceiverFn::new("counter", move |_: &u32| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_duplicate_registration_runs_twice() {
        let client = ConfigClient::<u32>::new(Arc::new(FixedFetcher(3)), Duration::from_secs(3));
        let counter = Arc::new(AtomicUsize::new(0));
        let receiver = counting(counter.clone());

        client.register_receiver(receiver.clone()).await;
        client.register_receiver(receiver).await;
        assert_eq!(client.receiver_count().await, 2);

        let config = client.get_config().await.expect("config");
        client
            .run_receivers(&config, &CancellationToken::new())
            .await
            .expect("no failures");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_receivers_is_ok() {
        let client = ConfigClient::<u32>::new(Arc::new(FixedFetcher(3)), Duration::from_secs(3));
        client
            .run_receivers(&3, &CancellationToken::new())
            .await
            .expect("no failures");
    }

    #[tokio::test]
    async fn test_refresh_loop_delivers_until_cancelled() {
        let client = Arc::new(ConfigClient::<u32>::new(
            Arc::new(FixedFetcher(3)),
            Duration::ZERO,
        ));
        let counter = Arc::new(AtomicUsize::new(0));
        client.register_receiver(counting(counter.clone())).await;

        let cancel = CancellationToken::new();
        let handle = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(Duration::from_millis(10), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .expect("loop panicked");

        assert!(counter.load(Ordering::SeqCst) >= 1);
        assert!(client.cache().refresh_count() >= 1);
    }
}
