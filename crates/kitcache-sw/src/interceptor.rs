//! Fetch interception.
//!
//! Precached assets are served cache-first and never revalidated. Every
//! other GET goes to the network first; successful `200` responses over
//! http(s) are copied into the cache, and the cache answers only when the
//! network fails.

use std::sync::Arc;

use http::Method;
use kitcache_net::{Network, Request, Response};
use tracing::{debug, trace, warn};
use url::Url;

use crate::events::{FetchDecision, FetchEvent, ResponseSource};
use crate::{Result, ServiceWorkerError, SharedCacheStorage, WorkerConfig};

/// Answers intercepted requests for one worker.
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    caches: SharedCacheStorage,
    network: Arc<dyn Network>,
}

impl FetchInterceptor {
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

    /// Decide how to answer `event`.
    pub async fn handle(&self, event: &mut FetchEvent) -> Result<FetchDecision> {
        if event.request.method != Method::GET {
            trace!(url = %event.request.url, method = %event.request.method, "Not intercepted");
            return Ok(FetchDecision::Passthrough);
        }

        let path = event.request.url.path();
        if self.config.is_precached(path) {
            let key = self.config.asset_url(path)?;
            if let Some(response) = self.lookup(&key).await {
                debug!(url = %event.request.url, "Served precached asset");
                return Ok(cached(response));
            }
            debug!(url = %event.request.url, "Precached asset missing from cache");
        }

        match self.fetch_from_network(event).await {
            Ok(response) => Ok(FetchDecision::Respond {
                response,
                source: ResponseSource::Network,
            }),
            Err(err) => match self.lookup(&event.request.url).await {
                Some(response) => {
                    debug!(url = %event.request.url, error = %err, "Network failed, served from cache");
                    Ok(cached(response))
                }
                None => {
                    warn!(url = %event.request.url, error = %err, "Network failed with no cached fallback");
                    Err(err)
                }
            },
        }
    }

    async fn fetch_from_network(&self, event: &mut FetchEvent) -> Result<Response> {
        let response = self.network.fetch(&event.request).await?;

        if !response.is_well_formed() {
            return Err(ServiceWorkerError::InvalidResponse(
                event.request.url.to_string(),
            ));
        }

        if event.request.is_http() && response.status == 200 {
            self.store_in_background(event, response.clone());
        }

        Ok(response)
    }

    /// Write a copy of the response without delaying the caller.
    fn store_in_background(&self, event: &mut FetchEvent, response: Response) {
        let caches = Arc::clone(&self.caches);
        let cache_name = self.config.cache_name.clone();
        let request: Request = event.request.clone();

        event.wait_until(async move {
            let mut caches = caches.write().await;
            if let Err(e) = caches.open(&cache_name).put(&request, &response) {
                warn!(url = %request.url, error = %e, "Failed to cache response");
            }
        });
    }

    async fn lookup(&self, url: &Url) -> Option<Response> {
        let caches = self.caches.read().await;
        let entry = caches.get(&self.config.cache_name)?.match_url(url)?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %url, error = %e, "Unreadable cache entry");
                None
            }
        }
    }
}

fn cached(response: Response) -> FetchDecision {
    FetchDecision::Respond {
        response,
        source: ResponseSource::Cache,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::AssetCacheManager;
    use crate::testing::{config, network_with_assets, FakeNetwork, ORIGIN};
    use crate::CacheStorage;
    use bytes::Bytes;
    use http::StatusCode;

    struct Fixture {
        caches: SharedCacheStorage,
        network: Arc<FakeNetwork>,
        interceptor: FetchInterceptor,
    }

    async fn installed() -> Fixture {
        let config = Arc::new(config("1"));
        let caches = CacheStorage::new().shared();
        let network = Arc::new(network_with_assets());

        let manager = AssetCacheManager::new(
            Arc::clone(&config),
            Arc::clone(&caches),
            Arc::clone(&network) as Arc<dyn Network>,
        );
        manager.install().await.unwrap();
        manager.activate().await.unwrap();

        let interceptor = FetchInterceptor::new(
            config,
            Arc::clone(&caches),
            Arc::clone(&network) as Arc<dyn Network>,
        );
        Fixture {
            caches,
            network,
            interceptor,
        }
    }

    fn get(path: &str) -> FetchEvent {
        FetchEvent::new(Request::get(FakeNetwork::url(path)))
    }

    async fn is_cached(caches: &SharedCacheStorage, url: &Url) -> bool {
        caches
            .read()
            .await
            .get("cache-1")
            .is_some_and(|cache| cache.match_url(url).is_some())
    }

    #[tokio::test]
    async fn test_precached_assets_skip_network() {
        let fixture = installed().await;
        fixture.network.set_offline(true);
        let before = fixture.network.calls();

        for path in ["/_app/immutable/start.js", "/_app/immutable/app.css", "/favicon.png"] {
            let mut event = get(path);
            let decision = fixture.interceptor.handle(&mut event).await.unwrap();
            assert_eq!(decision.source(), Some(ResponseSource::Cache));
            assert_eq!(decision.response().unwrap().status, 200);
        }

        assert_eq!(fixture.network.calls(), before);
    }

    #[tokio::test]
    async fn test_precached_path_matches_with_query() {
        let fixture = installed().await;
        fixture.network.set_offline(true);

        let url = Url::parse(ORIGIN).unwrap().join("/favicon.png?v=2").unwrap();
        let mut event = FetchEvent::new(Request::get(url));
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();

        assert_eq!(decision.source(), Some(ResponseSource::Cache));
        assert_eq!(decision.response().unwrap().text().unwrap(), "png");
    }

    #[tokio::test]
    async fn test_precache_miss_falls_through_to_network() {
        let fixture = installed().await;
        fixture
            .caches
            .write()
            .await
            .open("cache-1")
            .delete(&FakeNetwork::url("/favicon.png"));

        let mut event = get("/favicon.png");
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();

        assert_eq!(decision.source(), Some(ResponseSource::Network));
        assert_eq!(
            fixture.network.requested().last().map(String::as_str),
            Some("https://app.example.com/favicon.png")
        );
    }

    #[tokio::test]
    async fn test_successful_fetch_is_returned_and_cached() {
        let fixture = installed().await;
        fixture
            .network
            .route("/api/items", StatusCode::OK, r#"[{"id":1}]"#);

        let mut event = get("/api/items");
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Network));
        assert_eq!(decision.response().unwrap().text().unwrap(), r#"[{"id":1}]"#);

        event.settled().await;
        assert!(is_cached(&fixture.caches, &FakeNetwork::url("/api/items")).await);
    }

    #[tokio::test]
    async fn test_non_200_is_returned_but_not_cached() {
        let fixture = installed().await;
        fixture.network.route("/missing", StatusCode::NOT_FOUND, "nope");
        fixture.network.route("/created", StatusCode::CREATED, "made");

        for (path, status) in [("/missing", 404), ("/created", 201)] {
            let mut event = get(path);
            let decision = fixture.interceptor.handle(&mut event).await.unwrap();
            assert_eq!(decision.response().unwrap().status, status);
            assert_eq!(event.pending(), 0);
            event.settled().await;
            assert!(!is_cached(&fixture.caches, &FakeNetwork::url(path)).await);
        }
    }

    #[tokio::test]
    async fn test_non_http_scheme_is_not_cached() {
        let fixture = installed().await;
        let url = "chrome-extension://abcdef/inject.js";
        fixture.network.route_response(
            url,
            Response::new(Url::parse(url).unwrap(), StatusCode::OK, "x"),
        );

        let mut event = FetchEvent::new(Request::parse_get(url).unwrap());
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();

        assert_eq!(decision.source(), Some(ResponseSource::Network));
        assert_eq!(event.pending(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_to_cache() {
        let fixture = installed().await;
        fixture.network.route("/api/items", StatusCode::OK, "fresh");

        let mut event = get("/api/items");
        fixture.interceptor.handle(&mut event).await.unwrap();
        event.settled().await;

        fixture.network.set_offline(true);
        let mut event = get("/api/items");
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();

        assert_eq!(decision.source(), Some(ResponseSource::Cache));
        assert_eq!(decision.response().unwrap().text().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_network_failure_without_cache_propagates() {
        let fixture = installed().await;
        fixture.network.set_offline(true);

        let mut event = get("/api/never-seen");
        let result = fixture.interceptor.handle(&mut event).await;

        assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
    }

    #[tokio::test]
    async fn test_malformed_response_uses_cache_fallback() {
        let fixture = installed().await;
        fixture.network.route("/api/items", StatusCode::OK, "good");
        let mut event = get("/api/items");
        fixture.interceptor.handle(&mut event).await.unwrap();
        event.settled().await;

        let url = FakeNetwork::url("/api/items");
        fixture
            .network
            .route_response(url.as_str(), Response::network_error(url.clone()));

        let mut event = get("/api/items");
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();
        assert_eq!(decision.response().unwrap().text().unwrap(), "good");

        let mut event = get("/api/other");
        let other = FakeNetwork::url("/api/other");
        fixture
            .network
            .route_response(other.as_str(), Response::network_error(other.clone()));
        assert!(matches!(
            fixture.interceptor.handle(&mut event).await,
            Err(ServiceWorkerError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let fixture = installed().await;
        let before = fixture.network.calls();

        let request = Request::post(FakeNetwork::url("/api/items"), Bytes::from_static(b"{}"));
        let mut event = FetchEvent::new(request);
        let decision = fixture.interceptor.handle(&mut event).await.unwrap();

        assert!(matches!(decision, FetchDecision::Passthrough));
        assert_eq!(fixture.network.calls(), before);
        assert_eq!(event.pending(), 0);
    }
}
