//! Precaching at install and generation eviction at activate.

use std::sync::Arc;

use futures::future::try_join_all;
use kitcache_net::{Network, Request, Response};
use tracing::{debug, info, instrument};

use crate::{Result, ServiceWorkerError, SharedCacheStorage, WorkerConfig};

/// Owns the worker's cache generation.
pub struct AssetCacheManager {
    config: Arc<WorkerConfig>,
    caches: SharedCacheStorage,
    network: Arc<dyn Network>,
}

impl AssetCacheManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: SharedCacheStorage,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            config,
            caches,
            network,
        }
    }

    /// Name of the cache generation this manager owns.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Fetch every precache asset and store it in the current generation.
    ///
    /// All assets are fetched before anything is written; a single failed
    /// or non-OK fetch fails the whole install and leaves the store empty.
    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn install(&self) -> Result<()> {
        self.caches.write().await.open(&self.config.cache_name);

        let fetches = self
            .config
            .assets
            .iter()
            .map(|path| self.fetch_asset(path));
        let fetched = try_join_all(fetches).await?;

        let mut caches = self.caches.write().await;
        let cache = caches.open(&self.config.cache_name);
        for (request, response) in &fetched {
            cache.put(request, response)?;
        }

        info!(assets = fetched.len(), "Precache populated");
        Ok(())
    }

    async fn fetch_asset(&self, path: &str) -> Result<(Request, Response)> {
        let request = Request::get(self.config.asset_url(path)?);
        let failed = |reason: String| ServiceWorkerError::InstallFailed {
            url: request.url.to_string(),
            reason,
        };

        let response = self
            .network
            .fetch(&request)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.is_well_formed() {
            return Err(failed("invalid response".to_string()));
        }
        if !response.ok() {
            return Err(failed(format!("status {}", response.status)));
        }

        debug!(url = %request.url, "Precache asset fetched");
        Ok((request, response))
    }

    /// Delete every cache store not named after the current generation.
    ///
    /// Returns the names of the deleted stores.
    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut caches = self.caches.write().await;

        let stale: Vec<String> = caches
            .keys()
            .into_iter()
            .filter(|name| *name != self.config.cache_name)
            .collect();

        for name in &stale {
            caches.delete(name);
            info!(stale = %name, "Deleted old cache generation");
        }

        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config, network_with_assets, FakeNetwork};
    use crate::CacheStorage;
    use http::StatusCode;

    fn manager(version: &str, caches: SharedCacheStorage, network: Arc<FakeNetwork>) -> AssetCacheManager {
        AssetCacheManager::new(Arc::new(config(version)), caches, network)
    }

    #[tokio::test]
    async fn test_install_populates_every_asset() {
        let caches = CacheStorage::new().shared();
        let network = Arc::new(network_with_assets());
        let manager = manager("1", Arc::clone(&caches), Arc::clone(&network));

        manager.install().await.unwrap();

        let storage = caches.read().await;
        let cache = storage.get("cache-1").unwrap();
        assert_eq!(
            cache.keys(),
            vec![
                "https://app.example.com/_app/immutable/app.css",
                "https://app.example.com/_app/immutable/start.js",
                "https://app.example.com/favicon.png",
            ]
        );

        let mut requested = network.requested();
        requested.sort();
        assert_eq!(requested, cache.keys());
    }

    #[tokio::test]
    async fn test_install_fails_when_an_asset_fails() {
        let caches = CacheStorage::new().shared();
        let network = Arc::new(FakeNetwork::new());
        network.route("/_app/immutable/start.js", StatusCode::OK, "start()");
        network.route("/_app/immutable/app.css", StatusCode::OK, "body{}");
        let manager = manager("1", Arc::clone(&caches), network);

        let err = manager.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { ref url, .. } if url.ends_with("/favicon.png")));

        let storage = caches.read().await;
        assert!(storage.get("cache-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_fails_on_non_ok_status() {
        let caches = CacheStorage::new().shared();
        let network = Arc::new(network_with_assets());
        network.route("/favicon.png", StatusCode::NOT_FOUND, "");
        let manager = manager("1", caches, network);

        assert!(matches!(
            manager.install().await,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_does_not_reuse_older_generation() {
        let caches = CacheStorage::new().shared();
        let network = Arc::new(network_with_assets());

        manager("1", Arc::clone(&caches), Arc::clone(&network))
            .install()
            .await
            .unwrap();
        manager("2", Arc::clone(&caches), Arc::clone(&network))
            .install()
            .await
            .unwrap();

        assert_eq!(network.calls(), 6);
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_generations() {
        let caches = CacheStorage::new().shared();
        {
            let mut storage = caches.write().await;
            storage.open("cache-0");
            storage.open("cache-1");
            storage.open("unrelated");
        }
        let manager = manager("1", Arc::clone(&caches), Arc::new(FakeNetwork::new()));

        let deleted = manager.activate().await.unwrap();

        assert_eq!(deleted, vec!["cache-0", "unrelated"]);
        assert_eq!(caches.read().await.keys(), vec!["cache-1"]);
    }

    #[tokio::test]
    async fn test_activate_without_current_store() {
        let caches = CacheStorage::new().shared();
        caches.write().await.open("cache-0");
        let manager = manager("1", Arc::clone(&caches), Arc::new(FakeNetwork::new()));

        manager.activate().await.unwrap();

        assert!(caches.read().await.keys().is_empty());
    }
}
