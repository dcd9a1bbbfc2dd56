#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quizcache_net::{Fetcher, NetError, Request, Response, ResponseType};
use quizcache_sw::{
    Cache, CacheError, CacheStorage, LifecycleHost, MemoryCacheStorage, OfflineCacheManager,
    SwError, WorkerConfig,
};
use tokio::sync::Notify;
use url::Url;

pub const SCOPE: &str = "https://quiz.test/";
pub const FONTS: &str = "https://fonts.googleapis.com/css2?family=Noto+Sans+JP:wght@300;400;500;700;900&family=Space+Mono:wght@400;700&display=swap";

pub fn config() -> WorkerConfig {
    WorkerConfig::default().with_scope(SCOPE)
}

pub fn url(path: &str) -> String {
    Url::parse(SCOPE).unwrap().join(path).unwrap().to_string()
}

#[derive(Clone)]
enum Route {
    Respond {
        status: u16,
        body: &'static str,
        response_type: ResponseType,
    },
    Down,
}

/// In-process network with scripted routes and per-URL hit counts.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl FakeNetwork {
    /// Network serving every default asset with 200.
    pub fn serving_app() -> Arc<Self> {
        let network = Arc::new(Self::default());
        for path in ["drone_quiz.html", "manifest.json", "icon-192.png", "icon-512.png"] {
            network.ok(&url(path), "asset");
        }
        network.ok(FONTS, "@font-face{}");
        network
    }

    pub fn ok(&self, url: &str, body: &'static str) {
        self.respond(url, 200, body, ResponseType::Basic);
    }

    pub fn respond(&self, url: &str, status: u16, body: &'static str, response_type: ResponseType) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route::Respond {
                status,
                body,
                response_type,
            },
        );
    }

    pub fn down(&self, url: &str) {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Down);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        *self.hits.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed(format!("offline: {key}")));
        }

        let route = self.routes.lock().unwrap().get(&key).cloned();
        match route {
            Some(Route::Respond {
                status,
                body,
                response_type,
            }) => {
                if response_type == ResponseType::Opaque {
                    Ok(Response::opaque(request.url.clone(), body))
                } else {
                    Ok(Response::new(request.url.clone(), status, body).with_type(response_type))
                }
            }
            Some(Route::Down) => Err(NetError::RequestFailed(format!("unreachable: {key}"))),
            None => Ok(Response::new(request.url.clone(), 404, "")),
        }
    }
}

/// Memory storage whose `delete` fails for chosen generation names and
/// whose `keys` can be made to fail.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryCacheStorage,
    undeletable: Mutex<HashSet<String>>,
    keys_broken: AtomicBool,
}

impl FlakyStorage {
    pub fn refuse_delete(&self, name: &str) {
        self.undeletable.lock().unwrap().insert(name.to_string());
    }

    pub fn break_keys(&self) {
        self.keys_broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(CacheError::Storage(format!("{name} is locked")));
        }
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        if self.keys_broken.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("index unreadable".to_string()));
        }
        self.inner.keys().await
    }
}

/// Memory storage whose entry writes wait until [`GatedStorage::release`].
#[derive(Default)]
pub struct GatedStorage {
    pub inner: MemoryCacheStorage,
    gate: Arc<Notify>,
    writes_started: Arc<AtomicUsize>,
}

impl GatedStorage {
    /// Let every pending and future write through.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }
}

struct GatedCache {
    inner: Arc<dyn Cache>,
    gate: Arc<Notify>,
    writes_started: Arc<AtomicUsize>,
}

#[async_trait]
impl Cache for GatedCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        self.inner.match_request(request).await
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        // Pass the permit on so later writes are not held back.
        self.gate.notify_one();
        self.inner.put(request, response).await
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        self.inner.delete(request).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }
}

#[async_trait]
impl CacheStorage for GatedStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        Ok(Arc::new(GatedCache {
            inner: self.inner.open(name).await?,
            gate: Arc::clone(&self.gate),
            writes_started: Arc::clone(&self.writes_started),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }
}

/// Records the hooks a worker calls.
#[derive(Default)]
pub struct RecordingHost {
    pub skipped_waiting: AtomicBool,
    pub claims: AtomicUsize,
    pub clients: usize,
}

impl RecordingHost {
    pub fn with_clients(clients: usize) -> Self {
        Self {
            clients,
            ..Default::default()
        }
    }
}

#[async_trait]
impl LifecycleHost for RecordingHost {
    fn skip_waiting(&self) {
        self.skipped_waiting.store(true, Ordering::SeqCst);
    }

    async fn claim_clients(&self) -> Result<usize, SwError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(self.clients)
    }
}

pub fn manager(
    config: &WorkerConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<FakeNetwork>,
) -> OfflineCacheManager {
    OfflineCacheManager::new(config, storage, network).unwrap()
}

/// Cached response for `url` in generation `name`, if any.
pub async fn cached(storage: &dyn CacheStorage, name: &str, url: &str) -> Option<Response> {
    let cache = storage.open(name).await.unwrap();
    cache
        .match_request(&Request::parse(url).unwrap())
        .await
        .unwrap()
}
