//! Named cache stores keyed by request identity.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache ("<app-prefix>-<version>")
//!             └── CacheKey (method + URL) → CacheEntry
//! ```
//!
//! The traits are the seam to the host's real storage; [`MemoryCacheStorage`]
//! is the in-process implementation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use offline_net::{Request, Response, ResponseType, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Errors reported by a cache backend.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Request not cacheable: {0}")]
    NotCacheable(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Request identity used as the cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for `request`.
    pub fn for_request(request: &Request) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            method: request.method.as_str().to_string(),
            url: url.into(),
        }
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Final response URL, if known.
    pub url: Option<String>,
    /// Response status (0 for opaque).
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
    /// Whether the response was opaque.
    pub opaque: bool,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.as_ref().map(|u| u.to_string()),
            status: response.status,
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.bytes().to_vec(),
            opaque: response.is_opaque(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        let mut response = Response::new(self.status, self.body.clone());
        response.headers = headers;
        response.url = self.url.as_deref().and_then(|u| Url::parse(u).ok());
        if self.opaque {
            response.response_type = ResponseType::Opaque;
        }
        response
    }
}

/// A single named cache store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Look up a stored response for `request`.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError>;

    /// Store `response` under `request`, replacing any previous entry.
    async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError>;

    /// All keys in the store.
    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError>;
}

/// The set of named stores (the `caches` global).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;

    /// Check if a store exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a store. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all stores.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let key = CacheKey::for_request(request);
        let entries = self.entries.read().await;
        Ok(entries.get(&key).map(CacheEntry::to_response))
    }

    async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        if request.method != http::Method::GET {
            return Err(CacheError::NotCacheable(format!(
                "{} {}",
                request.method, request.url
            )));
        }
        let key = CacheKey::for_request(request);
        trace!(cache = %self.name, url = %key.url, "Cache put");
        self.entries
            .write()
            .await
            .insert(key, CacheEntry::from_response(response));
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let mut caches = self.caches.write().await;
        let cache: Arc<dyn Cache> = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(name)))
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
