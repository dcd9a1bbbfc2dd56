//! Subcommand implementations. Each returns the JSON document printed on
//! stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use http::Method;
use quizcache_common::{with_timeout, RetryConfig};
use quizcache_net::{Destination, Fetcher, LoaderConfig, Request, ResourceLoader, Unreachable};
use quizcache_sw::{
    CacheStorage, FetchDecision, MemoryCacheStorage, OfflineCacheManager, ServiceWorkerContainer,
    WorkerConfig,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: WorkerConfig,
    /// Cache store snapshot file.
    pub store: PathBuf,
    pub offline: bool,
}

impl Session {
    fn fetcher(&self) -> anyhow::Result<Arc<dyn Fetcher>> {
        if self.offline {
            debug!("Network disabled");
            return Ok(Arc::new(Unreachable));
        }
        let loader = ResourceLoader::new(LoaderConfig {
            origin: Some(self.config.scope_url()?),
            ..Default::default()
        })?;
        Ok(Arc::new(loader))
    }

    async fn open_store(&self) -> anyhow::Result<Arc<MemoryCacheStorage>> {
        let storage = MemoryCacheStorage::load(&self.store)
            .await
            .with_context(|| format!("reading cache store {}", self.store.display()))?;
        Ok(Arc::new(storage))
    }

    async fn save_store(&self, storage: &MemoryCacheStorage) -> anyhow::Result<()> {
        storage
            .save(&self.store)
            .await
            .with_context(|| format!("writing cache store {}", self.store.display()))
    }
}

/// `<cache dir>/quizcache/caches.json`
pub fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quizcache")
        .join("caches.json")
}

/// Install the configured generation and activate it, retrying transient
/// failures.
pub async fn install(session: &Session, attempts: u32) -> anyhow::Result<Value> {
    let storage = session.open_store().await?;
    let manager = OfflineCacheManager::new(&session.config, storage.clone(), session.fetcher()?)?;
    let (container, mut events) = ServiceWorkerContainer::new(session.config.scope_url()?);

    let result = container
        .register_with_retry(manager, &RetryConfig::attempts(attempts))
        .await;
    while let Ok(event) = events.try_recv() {
        debug!(?event, "Worker event");
    }
    let outcome = result.with_context(|| format!("installing {}", session.config.cache_name))?;

    session.save_store(&storage).await?;
    info!(cache = %session.config.cache_name, store = %session.store.display(), "Cache store saved");
    Ok(serde_json::to_value(&outcome)?)
}

/// Run one request through the fetch handler of the configured generation.
/// An owned request that has not settled within `timeout` fails.
pub async fn fetch(session: &Session, request: Request, timeout: Duration) -> anyhow::Result<Value> {
    let storage = session.open_store().await?;
    if !storage.has(&session.config.cache_name).await? {
        warn!(
            cache = %session.config.cache_name,
            "Generation not installed, run `quizcache install` first"
        );
    }
    let manager = OfflineCacheManager::new(&session.config, storage.clone(), session.fetcher()?)?;

    let url = request.url.to_string();
    let method = request.method.to_string();
    match manager.handle_fetch(request) {
        FetchDecision::PassThrough => Ok(json!({
            "url": url,
            "method": method,
            "handled": false,
        })),
        FetchDecision::Owned(pending) => {
            let served = with_timeout(timeout, || pending)
                .await
                .with_context(|| format!("gave up on {url}"))?
                .with_context(|| format!("no response for {url}"))?;
            manager.flush().await;
            session.save_store(&storage).await?;

            let response = &served.response;
            Ok(json!({
                "url": url,
                "method": method,
                "handled": true,
                "source": served.source,
                "status": response.status,
                "response_type": response.response_type,
                "response_url": response.url.as_str(),
                "content_type": response.content_type().map(|m| m.to_string()),
                "bytes": response.body().len(),
            }))
        }
    }
}

/// Summarize the stored generations.
pub async fn status(session: &Session, list_entries: bool) -> anyhow::Result<Value> {
    let storage = session.open_store().await?;
    let snapshot = storage.snapshot().await;

    let generations: Vec<Value> = snapshot
        .caches
        .iter()
        .map(|(name, entries)| {
            let mut generation = json!({
                "name": name,
                "current": *name == session.config.cache_name,
                "entries": entries.len(),
                "bytes": entries.iter().map(|e| e.body.len()).sum::<usize>(),
            });
            if list_entries {
                generation["urls"] = entries
                    .iter()
                    .map(|e| json!({ "url": e.url, "status": e.status, "cached_at": e.cached_at }))
                    .collect();
            }
            generation
        })
        .collect();

    Ok(json!({
        "store": session.store,
        "current": session.config.cache_name,
        "generations": generations,
    }))
}

/// Build a request from command-line arguments.
pub fn build_request(
    url: &str,
    method: &str,
    navigate: bool,
    destination: Option<&str>,
) -> anyhow::Result<Request> {
    let url = Url::parse(url).with_context(|| format!("invalid URL '{url}'"))?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;

    let mut request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    request.method = method;
    if let Some(destination) = destination {
        request = request.destination(parse_destination(destination)?);
    }
    Ok(request)
}

fn parse_destination(raw: &str) -> anyhow::Result<Destination> {
    match serde_json::from_value(Value::String(raw.to_ascii_lowercase())) {
        Ok(destination) => Ok(destination),
        Err(_) => bail!("unknown destination '{raw}'"),
    }
}
