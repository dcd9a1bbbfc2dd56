//! # quizcache net
//!
//! Request/response model and network access for the quizcache worker.
//!
//! ## Design Goals
//!
//! 1. **fetch()-shaped types**: requests carry a method, mode and destination;
//!    responses carry a status, a response type and a body that can be
//!    duplicated for a cache write.
//! 2. **Pluggable network**: the worker only sees the [`Fetcher`] trait, so
//!    hosts and tests can swap the reqwest-backed [`ResourceLoader`] out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::RequestFailed(_) | NetError::Timeout(_) => true,
            NetError::HttpError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            NetError::InvalidUrl(_) | NetError::UnsupportedScheme(_) => false,
        }
    }
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

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    /// Top-level or nested document navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    Worker,
    /// `fetch()` / XHR and anything without a more specific destination.
    #[default]
    Empty,
}

/// Request mode, deciding how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// How much of a response the requester is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response exposed through CORS.
    Cors,
    /// Cross-origin no-cors response: status 0, no headers.
    Opaque,
    /// Network error placeholder.
    Error,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: Destination,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: Destination::default(),
            timeout: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a top-level document navigation.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether the URL uses a network scheme (`http` or `https`).
    pub fn has_network_scheme(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Whether this request is a full-document navigation.
    pub fn is_navigation(&self) -> bool {
        self.destination == Destination::Document
    }

    /// URL used as cache key, without fragment.
    pub fn cache_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

/// HTTP response.
///
/// The body is an immutable [`Bytes`] buffer, so [`Response::duplicate`]
/// hands out an independent readable copy without copying the payload.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    /// Status code, `0` for opaque and error responses.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: Bytes,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        let status_text = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            url,
            status,
            status_text,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: body.into(),
        }
    }

    /// Create an opaque response for a cross-origin no-cors request.
    pub fn opaque(url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            response_type: ResponseType::Opaque,
            ..Self::new(url, 0, body)
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed Content-Type, if present and valid.
    pub fn content_type(&self) -> Option<Mime> {
        self.header("content-type").and_then(|s| s.parse().ok())
    }

    /// Independent copy of this response, sharing the body buffer.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network access as seen by the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. Fails with a [`NetError`] when the network is
    /// unreachable; HTTP error statuses are successful fetches.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// A network that is always down.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unreachable;

#[async_trait]
impl Fetcher for Unreachable {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        tracing::debug!(url = %request.url, "Network unreachable");
        Err(NetError::RequestFailed(format!(
            "network unreachable: {}",
            request.url
        )))
    }
}
