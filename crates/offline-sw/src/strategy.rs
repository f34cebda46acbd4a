//! Response strategies.
//!
//! Both strategies return a [`HandledResponse`]: the response for the page
//! plus a [`CacheUpdate`] describing what happened to the opportunistic cache
//! write. Write failures never change the response; they are only reported.

use std::sync::Arc;

use offline_net::{Fetcher, NetError, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheError};

/// Body served for a navigation when neither network nor cache can answer.
pub const OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html lang=\"en\"><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page has not been saved for offline use yet. \
Reconnect to the network and reload.</p></body></html>";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The synthesized offline page.
    OfflinePage,
}

/// Outcome of a best-effort cache write.
#[derive(Debug)]
pub enum BestEffort {
    /// The response was stored.
    Stored,
    /// The response was not eligible for caching.
    NotCacheable { status: u16 },
    /// The write failed and was ignored.
    Failed(CacheError),
}

impl BestEffort {
    pub fn is_stored(&self) -> bool {
        matches!(self, BestEffort::Stored)
    }
}

/// Cache write attached to a response.
#[derive(Debug)]
pub enum CacheUpdate {
    /// No write was attempted.
    None,
    /// The write finished before the response was returned.
    Settled(BestEffort),
    /// The write runs in the background.
    Background(JoinHandle<BestEffort>),
}

impl CacheUpdate {
    /// Wait for the write, if any, and return its outcome.
    pub async fn settle(self) -> Option<BestEffort> {
        match self {
            CacheUpdate::None => None,
            CacheUpdate::Settled(outcome) => Some(outcome),
            CacheUpdate::Background(handle) => Some(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => BestEffort::Failed(CacheError::Backend(format!(
                    "cache write task failed: {e}"
                ))),
            }),
        }
    }
}

/// A response chosen by a strategy.
#[derive(Debug)]
pub struct HandledResponse {
    pub response: Response,
    pub source: ResponseSource,
    pub cache_update: CacheUpdate,
}

impl HandledResponse {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            cache_update: CacheUpdate::None,
        }
    }
}

/// Serve from `cache` if present; otherwise fetch and store a copy.
///
/// Only `200` and opaque responses are stored. On network failure the cache
/// is consulted once more, since a concurrent handler may have filled it.
pub async fn cache_first(
    request: &Request,
    cache: &dyn Cache,
    fetcher: &dyn Fetcher,
) -> Result<HandledResponse, NetError> {
    if let Some(cached) = lookup(cache, request).await {
        debug!(url = %request.url, cache = cache.name(), "Cache hit");
        return Ok(HandledResponse::new(cached, ResponseSource::Cache));
    }

    debug!(url = %request.url, cache = cache.name(), "Cache miss");

    match fetcher.fetch(request).await {
        Ok(response) => {
            let outcome = store(cache, request, &response).await;
            Ok(HandledResponse {
                response,
                source: ResponseSource::Network,
                cache_update: CacheUpdate::Settled(outcome),
            })
        }
        Err(e) => match lookup(cache, request).await {
            Some(cached) => {
                debug!(url = %request.url, error = %e, "Network failed, serving late cache entry");
                Ok(HandledResponse::new(cached, ResponseSource::Cache))
            }
            None => Err(e),
        },
    }
}

/// Network first; on failure the cached shell, then [`OFFLINE_PAGE`].
///
/// Whatever the network returns, error statuses included, replaces the shell
/// entry under `shell` in the background.
pub async fn navigation_fallback(
    request: &Request,
    cache: Arc<dyn Cache>,
    shell: &Request,
    fetcher: &dyn Fetcher,
) -> HandledResponse {
    match fetcher.fetch(request).await {
        Ok(response) => {
            let copy = response.clone();
            let shell = shell.clone();
            let refresh = tokio::spawn(async move { write(cache.as_ref(), &shell, &copy).await });
            HandledResponse {
                response,
                source: ResponseSource::Network,
                cache_update: CacheUpdate::Background(refresh),
            }
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Navigation fetch failed");
            match lookup(cache.as_ref(), shell).await {
                Some(cached) => HandledResponse::new(cached, ResponseSource::Cache),
                None => offline_page(),
            }
        }
    }
}

/// The synthesized offline document.
pub fn offline_page() -> HandledResponse {
    HandledResponse::new(Response::html(OFFLINE_PAGE), ResponseSource::OfflinePage)
}

async fn lookup(cache: &dyn Cache, request: &Request) -> Option<Response> {
    match cache.match_request(request).await {
        Ok(hit) => hit,
        Err(e) => {
            warn!(url = %request.url, cache = cache.name(), error = %e, "Cache lookup failed");
            None
        }
    }
}

async fn store(cache: &dyn Cache, request: &Request, response: &Response) -> BestEffort {
    if response.status != 200 && !response.is_opaque() {
        return BestEffort::NotCacheable {
            status: response.status,
        };
    }
    write(cache, request, response).await
}

async fn write(cache: &dyn Cache, request: &Request, response: &Response) -> BestEffort {
    match cache.put(request, response).await {
        Ok(()) => BestEffort::Stored,
        Err(e) => {
            debug!(url = %request.url, cache = cache.name(), error = %e, "Ignoring cache write failure");
            BestEffort::Failed(e)
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use offline_net::Url;

    use super::testing::{FakeNetwork, ReadOnlyCache};
    use super::*;
    use crate::cache::{CacheKey, MemoryCache};

    const LIB: &str = "https://cdn.jsdelivr.net/npm/gif.js@0.2.0/dist/gif.js";
    const PAGE: &str = "https://example.com/gif/";
    const SHELL: &str = "https://example.com/gif/index.html";

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    fn nav(url: &str) -> Request {
        Request::navigate(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_cache_first_miss_then_hit() {
        let net = FakeNetwork::new();
        net.serve(LIB, Response::new(200, "lib"));
        let cache = MemoryCache::new("app-shell-v1");

        let first = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        assert!(first.cache_update.settle().await.unwrap().is_stored());

        let second = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.response.bytes().as_ref(), b"lib");
        assert_eq!(net.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network_even_offline() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let cache = MemoryCache::new("v1");
        cache.put(&get(LIB), &Response::new(200, "old")).await.unwrap();

        let handled = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(net.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let net = FakeNetwork::new();
        net.serve(LIB, Response::new(404, "missing"));
        let cache = MemoryCache::new("v1");

        let handled = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert_eq!(handled.response.status, 404);
        assert!(matches!(
            handled.cache_update.settle().await,
            Some(BestEffort::NotCacheable { status: 404 })
        ));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_first_stores_opaque() {
        let net = FakeNetwork::new();
        net.serve(LIB, Response::opaque(Url::parse(LIB).unwrap()));
        let cache = MemoryCache::new("v1");

        let handled = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert!(handled.response.is_opaque());
        assert!(handled.cache_update.settle().await.unwrap().is_stored());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_first_write_failure_is_reported_not_fatal() {
        let net = FakeNetwork::new();
        net.serve(LIB, Response::new(200, "lib"));

        let handled = cache_first(&get(LIB), &ReadOnlyCache, net.as_ref())
            .await
            .unwrap();
        assert_eq!(handled.response.bytes().as_ref(), b"lib");
        assert!(matches!(
            handled.cache_update.settle().await,
            Some(BestEffort::Failed(CacheError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn test_cache_first_network_failure_without_cache_propagates() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let cache = MemoryCache::new("v1");

        let err = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap_err();
        assert!(matches!(err, NetError::Offline));
    }

    #[tokio::test]
    async fn test_navigation_online_refreshes_shell() {
        let net = FakeNetwork::new();
        net.serve(PAGE, Response::html("<h1>fresh</h1>"));
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new("v1"));
        cache.put(&get(SHELL), &Response::html("<h1>stale</h1>")).await.unwrap();

        let handled = navigation_fallback(&nav(PAGE), cache.clone(), &get(SHELL), net.as_ref()).await;
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.text().unwrap(), "<h1>fresh</h1>");
        assert!(handled.cache_update.settle().await.unwrap().is_stored());

        let shell = cache.match_request(&get(SHELL)).await.unwrap().unwrap();
        assert_eq!(shell.text().unwrap(), "<h1>fresh</h1>");
    }

    #[tokio::test]
    async fn test_navigation_offline_serves_cached_shell() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new("v1"));
        cache.put(&get(SHELL), &Response::html("<h1>shell</h1>")).await.unwrap();

        let handled = navigation_fallback(&nav(PAGE), cache, &get(SHELL), net.as_ref()).await;
        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(handled.response.text().unwrap(), "<h1>shell</h1>");
    }

    #[tokio::test]
    async fn test_navigation_offline_without_shell_serves_offline_page() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new("v1"));

        let handled = navigation_fallback(&nav(PAGE), cache, &get(SHELL), net.as_ref()).await;
        assert_eq!(handled.source, ResponseSource::OfflinePage);
        assert_eq!(handled.response.status, 200);
        assert_eq!(
            handled.response.content_type().unwrap().essence_str(),
            "text/html"
        );
        assert!(handled.response.text().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_navigation_shell_write_failure_is_swallowed() {
        let net = FakeNetwork::new();
        net.serve(PAGE, Response::html("<h1>fresh</h1>"));

        let handled =
            navigation_fallback(&nav(PAGE), Arc::new(ReadOnlyCache), &get(SHELL), net.as_ref())
                .await;
        assert_eq!(handled.response.text().unwrap(), "<h1>fresh</h1>");
        assert!(matches!(
            handled.cache_update.settle().await,
            Some(BestEffort::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_navigation_error_status_replaces_shell() {
        let net = FakeNetwork::new();
        net.serve(PAGE, Response::new(404, "<h1>not found page</h1>"));
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new("v1"));
        cache.put(&get(SHELL), &Response::html("<h1>old shell</h1>")).await.unwrap();

        let handled = navigation_fallback(&nav(PAGE), cache.clone(), &get(SHELL), net.as_ref()).await;
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.status, 404);
        assert!(handled.cache_update.settle().await.unwrap().is_stored());

        let shell = cache.match_request(&get(SHELL)).await.unwrap().unwrap();
        assert_eq!(shell.status, 404);
        assert_eq!(shell.text().unwrap(), "<h1>not found page</h1>");
    }

    /// Misses on the first lookup and hits afterwards, as if another handler
    /// stored the entry while this one was on the network.
    struct LateCache {
        lookups: AtomicUsize,
        entry: Response,
    }

    #[async_trait]
    impl Cache for LateCache {
        fn name(&self) -> &str {
            "late"
        }

        async fn match_request(&self, _: &Request) -> Result<Option<Response>, CacheError> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok((n > 0).then(|| self.entry.clone()))
        }

        async fn put(&self, _: &Request, _: &Response) -> Result<(), CacheError> {
            Ok(())
        }

        async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_cache_first_network_failure_serves_late_entry() {
        let net = FakeNetwork::new();
        net.set_offline(true);
        let cache = LateCache {
            lookups: AtomicUsize::new(0),
            entry: Response::new(200, "filled meanwhile"),
        };

        let handled = cache_first(&get(LIB), &cache, net.as_ref()).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(handled.response.text().unwrap(), "filled meanwhile");
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(net.calls(), 1);
    }
}
