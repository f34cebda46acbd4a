//! # Offline Net
//!
//! Networking primitives for the offline shell worker.
//!
//! ## Design Goals
//!
//! 1. **Plain values**: requests and responses are cloneable snapshots so a
//!    response can be returned to the page and stored in a cache at once
//! 2. **Pluggable network**: everything that goes to the network goes through
//!    the [`Fetcher`] trait, so policies can be tested against fakes
//! 3. **Origin patterns**: [`UrlPattern`] matches third-party resources by
//!    origin and path

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};

pub use url::Url;

pub mod pattern;

pub use pattern::{PatternError, PatternSet, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring the fetch standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin without CORS; the response comes back opaque.
    #[default]
    NoCors,
    /// Cross-origin with CORS.
    Cors,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// An intercepted or outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
    /// The page that issued the request, if any.
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a GET request for a subresource.
    pub fn get(url: Url) -> Self {
        Self::with_method(Method::GET, url)
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a request with an arbitrary method.
    pub fn with_method(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            credentials: CredentialsMode::SameOrigin,
            referrer: None,
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether this is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// How much of a response the requester is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with CORS.
    Cors,
    /// Cross-origin no-cors response: status and body are hidden.
    Opaque,
}

/// A full response snapshot.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL, `None` for synthesized responses.
    pub url: Option<Url>,
    /// Status code; 0 for opaque responses.
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: Bytes,
}

impl Response {
    /// Create a basic response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: body.into(),
        }
    }

    /// Create a `200 OK` HTML response.
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::new(200, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
    }

    /// Create an opaque response for `url`.
    pub fn opaque(url: Url) -> Self {
        Self {
            url: Some(url),
            status: 0,
            headers: HeaderMap::new(),
            response_type: ResponseType::Opaque,
            body: Bytes::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if the response is opaque.
    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Parsed `Content-Type`, if any.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// The body bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> Result<&str, NetError> {
        std::str::from_utf8(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Hide status, headers and body, as a browser does for no-cors
    /// cross-origin responses.
    pub fn into_opaque(self) -> Self {
        Self {
            url: self.url,
            status: 0,
            headers: HeaderMap::new(),
            response_type: ResponseType::Opaque,
            body: Bytes::new(),
        }
    }
}

/// The network, as seen by the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a live network fetch.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("offline-shell/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header(header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(url = %url, status, body_len = body.len(), "Response received");

        let cross_origin = request
            .referrer
            .as_ref()
            .is_some_and(|page| page.origin() != url.origin());

        let response_type = match request.mode {
            RequestMode::Navigate => ResponseType::Basic,
            _ if !cross_origin => ResponseType::Basic,
            RequestMode::SameOrigin => {
                return Err(NetError::RequestFailed(format!(
                    "cross-origin response for same-origin request: {url}"
                )));
            }
            RequestMode::Cors => ResponseType::Cors,
            RequestMode::NoCors => ResponseType::Opaque,
        };

        let response = Response {
            url: Some(url),
            status,
            headers,
            response_type: ResponseType::Basic,
            body,
        };

        Ok(match response_type {
            ResponseType::Opaque => response.into_opaque(),
            other => Response {
                response_type: other,
                ..response
            },
        })
    }
}
