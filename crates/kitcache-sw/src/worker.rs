//! The cache worker script.

use std::sync::Arc;

use async_trait::async_trait;
use kitcache_net::Network;
use tracing::{debug, info};

use crate::events::{FetchDecision, FetchEvent, LifecycleHandler, MessageEvent, MessageOutcome, WorkerMessage};
use crate::{AssetCacheManager, FetchInterceptor, Result, SharedCacheStorage, WorkerConfig};

/// Lifecycle handler wiring the cache manager and the fetch interceptor
/// to one build's configuration.
pub struct CacheWorker {
    config: Arc<WorkerConfig>,
    manager: AssetCacheManager,
    interceptor: FetchInterceptor,
}

impl CacheWorker {
    pub fn new(config: WorkerConfig, caches: SharedCacheStorage, network: Arc<dyn Network>) -> Self {
        let config = Arc::new(config);
        info!(cache = %config.cache_name, assets = config.assets.len(), "Cache worker loaded");

        Self {
            manager: AssetCacheManager::new(
                Arc::clone(&config),
                Arc::clone(&caches),
                Arc::clone(&network),
            ),
            interceptor: FetchInterceptor::new(Arc::clone(&config), caches, network),
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

#[async_trait]
impl LifecycleHandler for CacheWorker {
    async fn on_install(&self) -> Result<()> {
        self.manager.install().await
    }

    async fn on_activate(&self) -> Result<()> {
        self.manager.activate().await.map(|_| ())
    }

    async fn on_fetch(&self, event: &mut FetchEvent) -> Result<FetchDecision> {
        self.interceptor.handle(event).await
    }

    async fn on_message(&self, event: &MessageEvent) -> MessageOutcome {
        match WorkerMessage::parse(&event.data) {
            Some(WorkerMessage::SkipWaiting) => {
                info!(cache = %self.config.cache_name, "Skip waiting requested");
                MessageOutcome::SkipWaiting
            }
            None => {
                debug!(data = %event.data, "Ignoring message");
                MessageOutcome::Ignored
            }
        }
    }
}
