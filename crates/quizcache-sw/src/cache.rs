//! Cache store seams and the in-memory store.
//!
//! The worker only talks to [`CacheStorage`] and [`Cache`]. Hosts that own
//! a real store implement these traits; [`MemoryCacheStorage`] is the store
//! used by the CLI host and by tests.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache (one per generation name)
//!             └── Request → Response
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use quizcache_net::{Fetcher, NetError, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

/// Errors raised by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Request method {0} cannot be cached")]
    UnsupportedMethod(Method),

    #[error("Response for {url} is not cacheable: {reason}")]
    Uncacheable { url: String, reason: String },

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Fetch failed for {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CacheError {
    /// Transient failures worth retrying the whole operation for.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Fetch { source, .. } => source.is_retryable(),
            CacheError::BadStatus { status, .. } => *status >= 500,
            CacheError::Storage(_) => true,
            CacheError::UnsupportedMethod(_) | CacheError::Uncacheable { .. } => false,
        }
    }
}

/// One named cache generation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Generation name this handle was opened under.
    fn name(&self) -> &str;

    /// Look up a stored response. A miss is `Ok(None)`.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError>;

    /// Store `response` for `request`, replacing any previous entry.
    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError>;

    /// Remove the entry for `request`.
    async fn delete(&self, request: &Request) -> Result<bool, CacheError>;

    /// URLs of all stored entries.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Store several entries as one batch.
    ///
    /// Stores that can write atomically should override this. The default
    /// writes one by one and removes what it wrote if a later write fails.
    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        let mut written: Vec<Request> = Vec::with_capacity(entries.len());
        for (request, response) in entries {
            if let Err(e) = self.put(&request, response).await {
                for done in &written {
                    let _ = self.delete(done).await;
                }
                return Err(e);
            }
            written.push(request);
        }
        Ok(())
    }

    /// Fetch `request` and store the response. Fails on a non-2xx status.
    async fn add(&self, fetcher: &dyn Fetcher, request: &Request) -> Result<(), CacheError> {
        let response = fetch_for_cache(fetcher, request).await?;
        self.put(request, response).await
    }

    /// Fetch every request, then store all responses as one batch.
    ///
    /// Nothing is stored unless every fetch succeeds with a 2xx status.
    async fn add_all(&self, fetcher: &dyn Fetcher, requests: &[Request]) -> Result<(), CacheError> {
        let responses =
            try_join_all(requests.iter().map(|request| fetch_for_cache(fetcher, request))).await?;
        let entries = requests.iter().cloned().zip(responses).collect();
        self.put_all(entries).await
    }
}

/// The set of named caches (`caches` in a page).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all caches.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}

/// Fetch for `Cache::add`: network errors and non-2xx statuses both fail.
async fn fetch_for_cache(fetcher: &dyn Fetcher, request: &Request) -> Result<Response, CacheError> {
    let response = fetcher
        .fetch(request)
        .await
        .map_err(|source| CacheError::Fetch {
            url: request.url.to_string(),
            source,
        })?;
    if !response.ok() {
        return Err(CacheError::BadStatus {
            url: request.url.to_string(),
            status: response.status,
        });
    }
    Ok(response)
}

/// Reject pairs the Cache API refuses to store.
fn check_cacheable(request: &Request, response: &Response) -> Result<(), CacheError> {
    if request.method != Method::GET {
        return Err(CacheError::UnsupportedMethod(request.method.clone()));
    }
    if vary_names(response).iter().any(|name| name == "*") {
        return Err(CacheError::Uncacheable {
            url: request.url.to_string(),
            reason: "Vary: *".to_string(),
        });
    }
    Ok(())
}

/// Lower-cased header names listed in the response's `Vary` headers.
fn vary_names(response: &Response) -> Vec<String> {
    response
        .headers
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

// ==================== Cache Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL, fragment stripped.
    pub url: String,

    /// Request headers named by the response's `Vary`.
    #[serde(default)]
    pub vary_headers: Vec<(String, String)>,

    /// Final response URL.
    pub response_url: String,

    /// Response status.
    pub status: u16,

    pub status_text: String,

    pub response_type: ResponseType,

    /// Response headers.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(request: &Request, response: &Response) -> Self {
        let vary_headers = vary_names(response)
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (name, value)
            })
            .collect();

        Self {
            url: request.cache_url(),
            vary_headers,
            response_url: response.url.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            response_type: response.response_type,
            headers: header_pairs(&response.headers),
            body: response.body().to_vec(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Whether the stored `Vary` request headers agree with `request`.
    fn vary_matches(&self, request: &Request) -> bool {
        self.vary_headers.iter().all(|(name, stored)| {
            let incoming = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            incoming == stored
        })
    }

    fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| CacheError::Storage(format!("corrupt entry {}: {e}", self.url)))?;
        let mut response = Response::new(url, self.status, self.body.clone())
            .with_type(self.response_type);
        response.status_text = self.status_text.clone();
        response.headers = header_map(&self.headers);
        Ok(response)
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(n, v);
        }
    }
    headers
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Memory Cache ====================

/// In-memory cache generation.
#[derive(Debug, Default)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn with_entries(name: &str, entries: Vec<CacheEntry>) -> Self {
        let entries = entries.into_iter().map(|e| (e.url.clone(), e)).collect();
        Self {
            name: name.to_string(),
            entries: RwLock::new(entries),
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
        if request.method != Method::GET {
            return Ok(None);
        }
        let entries = self.entries.read().await;
        match entries.get(&request.cache_url()) {
            Some(entry) if entry.vary_matches(request) => {
                trace!(cache = %self.name, url = %entry.url, "Cache hit");
                entry.to_response().map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        check_cacheable(request, &response)?;
        let entry = CacheEntry::new(request, &response);
        debug!(cache = %self.name, url = %entry.url, status = entry.status, "Cache put");
        self.entries.write().await.insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        let mut staged = Vec::with_capacity(entries.len());
        for (request, response) in &entries {
            check_cacheable(request, response)?;
            staged.push(CacheEntry::new(request, response));
        }
        let mut map = self.entries.write().await;
        for entry in staged {
            map.insert(entry.url.clone(), entry);
        }
        Ok(())
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&request.cache_url())
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ==================== Memory Cache Storage ====================

/// Serializable image of a [`MemoryCacheStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub caches: BTreeMap<String, Vec<CacheEntry>>,
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild storage from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Self {
        let caches = snapshot
            .caches
            .into_iter()
            .map(|(name, entries)| {
                let cache = Arc::new(MemoryCache::with_entries(&name, entries));
                (name, cache)
            })
            .collect();
        Self {
            caches: RwLock::new(caches),
        }
    }

    /// Capture the current contents.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let caches = self.caches.read().await;
        let mut snapshot = StorageSnapshot::default();
        for (name, cache) in caches.iter() {
            let mut entries: Vec<CacheEntry> =
                cache.entries.read().await.values().cloned().collect();
            entries.sort_by(|a, b| a.url.cmp(&b.url));
            snapshot.caches.insert(name.clone(), entries);
        }
        snapshot
    }

    /// Load storage from a JSON snapshot file. A missing file is empty storage.
    pub async fn load(path: &Path) -> quizcache_common::Result<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: StorageSnapshot = serde_json::from_slice(&raw).map_err(|e| {
            quizcache_common::Error::config_with_source(
                format!("corrupt cache snapshot {}", path.display()),
                e,
            )
        })?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write the current contents to a JSON snapshot file.
    pub async fn save(&self, path: &Path) -> quizcache_common::Result<()> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            quizcache_common::Error::config_with_source("cannot encode cache snapshot", e)
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if let Some(cache) = self.caches.read().await.get(name) {
            let cache: Arc<dyn Cache> = cache.clone();
            return Ok(cache);
        }
        let mut caches = self.caches.write().await;
        let cache: Arc<dyn Cache> = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Creating cache");
                Arc::new(MemoryCache::new(name))
            })
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
        let mut keys: Vec<String> = self.caches.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ok(url: &str, body: &'static str) -> Response {
        Response::new(Url::parse(url).unwrap(), 200, body)
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let cache = MemoryCache::new("v1");
        let request = Request::parse("https://quiz.test/style.css").unwrap();

        cache.put(&request, ok("https://quiz.test/style.css", "body{}")).await.unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.bytes(), Bytes::from_static(b"body{}"));

        let other = Request::parse("https://quiz.test/other.css").unwrap();
        assert!(cache.match_request(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_ignores_fragment() {
        let cache = MemoryCache::new("v1");
        let request = Request::parse("https://quiz.test/drone_quiz.html").unwrap();
        cache.put(&request, ok("https://quiz.test/drone_quiz.html", "<html>")).await.unwrap();

        let with_fragment = Request::parse("https://quiz.test/drone_quiz.html#q5").unwrap();
        assert!(cache.match_request(&with_fragment).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_rejects_post() {
        let cache = MemoryCache::new("v1");
        let request = Request::post(Url::parse("https://quiz.test/score").unwrap(), Bytes::new());
        let err = cache
            .put(&request, ok("https://quiz.test/score", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedMethod(_)));
    }

    #[tokio::test]
    async fn test_vary_header_must_match() {
        let cache = MemoryCache::new("v1");
        let request = Request::parse("https://quiz.test/data.json")
            .unwrap()
            .header(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("ja"));
        let response = ok("https://quiz.test/data.json", "{}")
            .with_header(http::header::VARY, HeaderValue::from_static("Accept-Language"));
        cache.put(&request, response).await.unwrap();

        assert!(cache.match_request(&request).await.unwrap().is_some());

        let english = Request::parse("https://quiz.test/data.json")
            .unwrap()
            .header(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        assert!(cache.match_request(&english).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vary_put_replaces_other_variant() {
        let cache = MemoryCache::new("v1");
        let variant = |lang: &'static str| {
            Request::parse("https://quiz.test/data.json")
                .unwrap()
                .header(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static(lang))
        };
        let response = |body: &'static str| {
            ok("https://quiz.test/data.json", body)
                .with_header(http::header::VARY, HeaderValue::from_static("Accept-Language"))
        };
        cache.put(&variant("ja"), response("ja")).await.unwrap();
        cache.put(&variant("en"), response("en")).await.unwrap();

        let hit = cache.match_request(&variant("en")).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "en");
        assert!(cache.match_request(&variant("ja")).await.unwrap().is_none());
        assert_eq!(cache.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vary_star_is_uncacheable() {
        let cache = MemoryCache::new("v1");
        let request = Request::parse("https://quiz.test/live").unwrap();
        let response = ok("https://quiz.test/live", "now")
            .with_header(http::header::VARY, HeaderValue::from_static("*"));
        let err = cache.put(&request, response).await.unwrap_err();
        assert!(matches!(err, CacheError::Uncacheable { .. }));
    }

    #[tokio::test]
    async fn test_cache_delete_and_keys() {
        let cache = MemoryCache::new("v1");
        let a = Request::parse("https://quiz.test/a.js").unwrap();
        let b = Request::parse("https://quiz.test/b.js").unwrap();
        cache.put(&a, ok("https://quiz.test/a.js", "a")).await.unwrap();
        cache.put(&b, ok("https://quiz.test/b.js", "b")).await.unwrap();

        assert_eq!(
            cache.keys().await.unwrap(),
            vec!["https://quiz.test/a.js", "https://quiz.test/b.js"]
        );
        assert!(cache.delete(&a).await.unwrap());
        assert!(!cache.delete(&a).await.unwrap());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());
        storage.open("v1").await.unwrap();
        storage.open("v0").await.unwrap();
        assert!(storage.has("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v0", "v1"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_returns_same_generation() {
        let storage = MemoryCacheStorage::new();
        let request = Request::parse("https://quiz.test/icon-192.png").unwrap();
        storage
            .open("v1")
            .await
            .unwrap()
            .put(&request, ok("https://quiz.test/icon-192.png", "png"))
            .await
            .unwrap();

        let reopened = storage.open("v1").await.unwrap();
        assert!(reopened.match_request(&request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_file_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("caches.json");

        let storage = MemoryCacheStorage::new();
        let request = Request::parse("https://quiz.test/manifest.json").unwrap();
        let response = ok("https://quiz.test/manifest.json", "{\"name\":\"quiz\"}").with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/manifest+json"),
        );
        storage.open("drone-quiz-v1").await.unwrap().put(&request, response).await.unwrap();
        storage.save(&path).await.unwrap();

        let restored = MemoryCacheStorage::load(&path).await.unwrap();
        assert_eq!(restored.keys().await.unwrap(), vec!["drone-quiz-v1"]);
        let hit = restored
            .open("drone-quiz-v1")
            .await
            .unwrap()
            .match_request(&request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.header("content-type"), Some("application/manifest+json"));
        assert_eq!(hit.text().unwrap(), "{\"name\":\"quiz\"}");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryCacheStorage::load(&dir.path().join("absent.json")).await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }
}
