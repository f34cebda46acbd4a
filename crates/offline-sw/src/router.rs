//! Fetch-event routing.

use std::sync::Arc;

use http::Method;
use offline_net::{Fetcher, NetError, Request};
use tracing::{trace, warn};

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::strategy::{self, BestEffort, CacheUpdate, HandledResponse, ResponseSource};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted.
    PassThrough,
    /// Network first with shell and offline-page fallback.
    Navigation,
    /// Same-origin resource under the base prefix; cache first.
    AppResource,
    /// Third-party resource matching a runtime pattern; cache first.
    RuntimeResource,
}

/// Result of a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker did not respond; the request goes to the network untouched.
    PassThrough,
    /// The worker substituted a response.
    Respond(HandledResponse),
}

impl FetchOutcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchOutcome::PassThrough)
    }

    /// The substituted response, if any.
    pub fn handled(self) -> Option<HandledResponse> {
        match self {
            FetchOutcome::PassThrough => None,
            FetchOutcome::Respond(handled) => Some(handled),
        }
    }
}

/// Classifies intercepted requests and dispatches them to a strategy.
#[derive(Clone)]
pub struct Router {
    config: Arc<WorkerConfig>,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl Router {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Decide how `request` is handled. Navigation wins over the same-origin
    /// check, which wins over runtime patterns.
    pub fn classify(&self, request: &Request) -> Route {
        let route = if request.method != Method::GET {
            Route::PassThrough
        } else if request.is_navigation() {
            Route::Navigation
        } else if self.config.is_in_scope(&request.url) {
            Route::AppResource
        } else if self.config.runtime_patterns.matches(&request.url) {
            Route::RuntimeResource
        } else {
            Route::PassThrough
        };
        trace!(url = %request.url, method = %request.method, ?route, "Classified request");
        route
    }

    /// Handle a fetch event.
    ///
    /// Errors only come from cache-first routes whose network fetch failed
    /// with nothing cached; navigations always produce a response.
    pub async fn handle(&self, request: &Request) -> Result<FetchOutcome, NetError> {
        match self.classify(request) {
            Route::PassThrough => Ok(FetchOutcome::PassThrough),
            Route::Navigation => Ok(FetchOutcome::Respond(self.navigate(request).await)),
            Route::AppResource | Route::RuntimeResource => {
                self.cache_first(request).await.map(FetchOutcome::Respond)
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<HandledResponse, NetError> {
        match self.caches.open(&self.config.cache_name).await {
            Ok(cache) => strategy::cache_first(request, cache.as_ref(), self.fetcher.as_ref()).await,
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "Cache unavailable, going to network");
                let response = self.fetcher.fetch(request).await?;
                Ok(HandledResponse {
                    response,
                    source: ResponseSource::Network,
                    cache_update: CacheUpdate::Settled(BestEffort::Failed(e)),
                })
            }
        }
    }

    async fn navigate(&self, request: &Request) -> HandledResponse {
        let shell = Request::get(self.config.shell_url.clone());
        match self.caches.open(&self.config.cache_name).await {
            Ok(cache) => {
                strategy::navigation_fallback(request, cache, &shell, self.fetcher.as_ref()).await
            }
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "Cache unavailable for navigation");
                match self.fetcher.fetch(request).await {
                    Ok(response) => HandledResponse {
                        response,
                        source: ResponseSource::Network,
                        cache_update: CacheUpdate::Settled(BestEffort::Failed(e)),
                    },
                    Err(_) => strategy::offline_page(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::cache::{Cache, CacheError, MemoryCacheStorage};
    use crate::config::WorkerSettings;
    use crate::strategy::testing::FakeNetwork;
    use offline_net::{Response, Url};

    const SCOPE: &str = "https://example.com/gif";

    fn make_router(net: Arc<FakeNetwork>) -> (Router, Arc<MemoryCacheStorage>) {
        let config = WorkerConfig::resolve(&WorkerSettings::default(), SCOPE).unwrap();
        let caches = Arc::new(MemoryCacheStorage::new());
        (Router::new(Arc::new(config), caches.clone(), net), caches)
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[test]
    fn test_classify() {
        let (router, _) = make_router(FakeNetwork::new());

        assert_eq!(
            router.classify(&get("https://example.com/gif/app.js")),
            Route::AppResource
        );
        assert_eq!(
            router.classify(&get("https://unpkg.com/gif.js@0.2.0/dist/gif.js")),
            Route::RuntimeResource
        );
        assert_eq!(
            router.classify(&get("https://example.com/other/app.js")),
            Route::PassThrough
        );
        assert_eq!(
            router.classify(&get("https://api.example.net/data")),
            Route::PassThrough
        );
    }

    #[test]
    fn test_navigation_beats_same_origin() {
        let (router, _) = make_router(FakeNetwork::new());
        let request = Request::navigate(Url::parse("https://example.com/gif/").unwrap());
        assert_eq!(router.classify(&request), Route::Navigation);
    }

    #[test]
    fn test_non_get_never_intercepted() {
        let (router, _) = make_router(FakeNetwork::new());
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            for url in [
                "https://example.com/gif/upload",
                "https://cdn.jsdelivr.net/npm/x",
            ] {
                let request = Request::with_method(method.clone(), Url::parse(url).unwrap());
                assert_eq!(router.classify(&request), Route::PassThrough);
            }
            let nav = Request::navigate(Url::parse("https://example.com/gif/").unwrap());
            let nav = Request {
                method: method.clone(),
                ..nav
            };
            assert_eq!(router.classify(&nav), Route::PassThrough);
        }
    }

    #[tokio::test]
    async fn test_non_get_passes_through_without_network() {
        let net = FakeNetwork::new();
        let (router, _) = make_router(net.clone());
        let request = Request::with_method(
            Method::POST,
            Url::parse("https://example.com/gif/upload").unwrap(),
        );
        assert!(router.handle(&request).await.unwrap().is_pass_through());
        assert_eq!(net.calls(), 0);
    }

    #[tokio::test]
    async fn test_runtime_resource_cached_after_first_fetch() {
        let url = "https://fonts.gstatic.com/s/roboto/v30/a.woff2";
        let net = FakeNetwork::new();
        net.serve(url, Response::new(200, "font"));
        let (router, _) = make_router(net.clone());

        let first = router.handle(&get(url)).await.unwrap().handled().unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        assert!(first.cache_update.settle().await.unwrap().is_stored());

        let second = router.handle(&get(url)).await.unwrap().handled().unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(net.calls(), 1);
    }

    #[tokio::test]
    async fn test_app_resource_uses_current_cache() {
        let url = "https://example.com/gif/app.js";
        let net = FakeNetwork::new();
        net.serve(url, Response::new(200, "app"));
        let (router, caches) = make_router(net);

        router.handle(&get(url)).await.unwrap();

        let cache = caches.open("app-shell-v1").await.unwrap();
        assert!(cache.match_request(&get(url)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unmatched_request_passes_through() {
        let net = FakeNetwork::new();
        let (router, caches) = make_router(net.clone());
        let outcome = router.handle(&get("https://api.example.net/data")).await.unwrap();
        assert!(outcome.is_pass_through());
        assert_eq!(net.calls(), 0);
        assert!(caches.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_offline_miss_is_an_error() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let (router, _) = make_router(net);
        assert!(router.handle(&get("https://example.com/gif/app.js")).await.is_err());
    }

    /// Storage whose stores can never be opened.
    struct BrokenStorage;

    #[async_trait]
    impl CacheStorage for BrokenStorage {
        async fn open(&self, _: &str) -> Result<Arc<dyn Cache>, CacheError> {
            Err(CacheError::Backend("storage disabled".into()))
        }

        async fn has(&self, _: &str) -> Result<bool, CacheError> {
            Ok(false)
        }

        async fn delete(&self, _: &str) -> Result<bool, CacheError> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }
    }

    fn broken_router(net: Arc<FakeNetwork>) -> Router {
        let config = WorkerConfig::resolve(&WorkerSettings::default(), SCOPE).unwrap();
        Router::new(Arc::new(config), Arc::new(BrokenStorage), net)
    }

    #[tokio::test]
    async fn test_unusable_store_falls_back_to_network() {
        let url = "https://example.com/gif/app.js";
        let net = FakeNetwork::new();
        net.serve(url, Response::new(200, "app"));
        let router = broken_router(net.clone());

        let handled = router.handle(&get(url)).await.unwrap().handled().unwrap();
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.text().unwrap(), "app");
        assert!(matches!(
            handled.cache_update.settle().await,
            Some(BestEffort::Failed(CacheError::Backend(_)))
        ));
        assert_eq!(net.calls(), 1);
    }

    #[tokio::test]
    async fn test_unusable_store_offline_cache_first_is_an_error() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let router = broken_router(net);
        assert!(router.handle(&get("https://example.com/gif/app.js")).await.is_err());
    }

    #[tokio::test]
    async fn test_unusable_store_navigation_online() {
        let net = FakeNetwork::new();
        net.serve("https://example.com/gif/", Response::html("<h1>live</h1>"));
        let router = broken_router(net);

        let request = Request::navigate(Url::parse("https://example.com/gif/").unwrap());
        let handled = router.handle(&request).await.unwrap().handled().unwrap();
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.text().unwrap(), "<h1>live</h1>");
        assert!(matches!(
            handled.cache_update.settle().await,
            Some(BestEffort::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_unusable_store_navigation_offline_serves_offline_page() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let router = broken_router(net);

        let request = Request::navigate(Url::parse("https://example.com/gif/").unwrap());
        let handled = router.handle(&request).await.unwrap().handled().unwrap();
        assert_eq!(handled.source, ResponseSource::OfflinePage);
        assert_eq!(handled.response.status, 200);
        assert!(handled.response.text().unwrap().contains("You are offline"));
    }

    #[tokio::test]
    async fn test_navigation_never_fails() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let (router, _) = make_router(net);
        let request = Request::navigate(Url::parse("https://example.com/gif/").unwrap());
        let handled = router.handle(&request).await.unwrap().handled().unwrap();
        assert_eq!(handled.source, ResponseSource::OfflinePage);
        assert_eq!(handled.response.status, 200);
    }
}
