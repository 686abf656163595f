//! # kitcache net
//!
//! Request and response values plus the network capability the service
//! worker fetches through.
//!
//! ## Design Goals
//!
//! 1. **Owned values**: requests and responses are plain data, cheap to clone
//! 2. **Injectable network**: the worker only sees the [`Network`] trait
//! 3. **HTTP backend**: [`HttpNetwork`] performs real fetches with reqwest

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Offline: {0}")]
    Offline(String),

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

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Parse `url` and create a GET request for it.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether the URL scheme is ordinary web traffic.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// Response classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// A normal response produced by a server or a cache.
    #[default]
    Basic,
    /// The network-error sentinel. Carries status 0 and no body.
    Error,
}

/// A response value.
///
/// The body is held as [`Bytes`], so cloning a response duplicates the
/// handle rather than consuming a stream: a clone can be stored while the
/// original is returned to the caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub kind: ResponseKind,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    /// Create the network-error sentinel for `url`.
    pub fn network_error(url: Url) -> Self {
        Self {
            url,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            kind: ResponseKind::Error,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A well-formed response is anything but the network-error sentinel.
    pub fn is_well_formed(&self) -> bool {
        self.kind == ResponseKind::Basic && StatusCode::from_u16(self.status).is_ok()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Something that can perform a fetch.
#[async_trait]
pub trait Network: Send + Sync {
    /// Fetch `request` from the network.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP client configuration.
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
            user_agent: format!("kitcache/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Network`] backed by a reqwest client.
pub struct HttpNetwork {
    client: Client,
    timeout: Duration,
}

impl HttpNetwork {
    /// Create a new HTTP network.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpNetwork initialized");

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    fn map_error(&self, error: reqwest::Error) -> NetError {
        if error.is_timeout() {
            NetError::Timeout(self.timeout)
        } else {
            NetError::HttpError(error)
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(
            request_id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        trace!(
            request_id = request.id.raw(),
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            kind: ResponseKind::Basic,
        })
    }
}
