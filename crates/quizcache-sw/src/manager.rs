//! The offline cache manager: install, activate and fetch handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use http::Method;
use quizcache_net::{Fetcher, Request, Response, ResponseType};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::cache::{Cache, CacheStorage};
use crate::config::{AssetPlan, WorkerConfig};
use crate::SwError;

/// Hooks the host exposes to a running worker.
#[async_trait]
pub trait LifecycleHost: Send + Sync {
    /// Activate as soon as install finishes instead of waiting for the old
    /// worker to go unused.
    fn skip_waiting(&self);

    /// Take control of already-open clients. Returns how many changed
    /// controller.
    async fn claim_clients(&self) -> Result<usize, SwError>;
}

/// Outcome of one best-effort asset.
#[derive(Debug, Clone, Serialize)]
pub struct AssetOutcome {
    pub url: String,
    pub error: Option<String>,
}

impl AssetOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub cache_name: String,
    pub required: Vec<String>,
    pub best_effort: Vec<AssetOutcome>,
}

/// Result of an activation. Activation itself never fails; swallowed
/// failures are listed here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivateReport {
    pub cache_name: String,
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Stale generations that could not be removed, with the reason.
    pub failed_deletions: Vec<(String, String)>,
    /// Set when the generation names could not be listed; nothing was
    /// deleted then.
    pub list_error: Option<String>,
    pub clients_claimed: usize,
    pub claim_error: Option<String>,
}

/// Where an owned response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Cache,
    Network,
    /// Cached shell page served for an offline navigation.
    OfflineFallback,
}

/// A response produced by the worker.
#[derive(Debug)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
}

/// Deferred response of an owned fetch. An error means the request fails
/// with no response.
pub type ResponseFuture = BoxFuture<'static, Result<Served, SwError>>;

/// What the fetch handler decided for a request.
pub enum FetchDecision {
    /// Not ours: the host applies its default handling.
    PassThrough,
    /// The worker produces the response.
    Owned(ResponseFuture),
}

impl FetchDecision {
    pub fn is_owned(&self) -> bool {
        matches!(self, FetchDecision::Owned(_))
    }
}

impl fmt::Debug for FetchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchDecision::PassThrough => f.write_str("PassThrough"),
            FetchDecision::Owned(_) => f.write_str("Owned(..)"),
        }
    }
}

/// Offline cache manager for one cache generation.
///
/// Cheap to clone; clones share the store, the network and the set of
/// in-flight background cache writes.
#[derive(Clone)]
pub struct OfflineCacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    cache_name: String,
    plan: AssetPlan,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    pending_writes: Mutex<JoinSet<()>>,
}

impl OfflineCacheManager {
    /// Validate `config` and build a manager over the given store and network.
    pub fn new(
        config: &WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, SwError> {
        let plan = config.plan()?;
        debug!(
            cache = %config.cache_name,
            required = plan.required.len(),
            best_effort = plan.best_effort.len(),
            "Offline cache manager created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                cache_name: config.cache_name.clone(),
                plan,
                storage,
                fetcher,
                pending_writes: Mutex::new(JoinSet::new()),
            }),
        })
    }

    /// Current generation name.
    pub fn cache_name(&self) -> &str {
        &self.inner.cache_name
    }

    pub fn plan(&self) -> &AssetPlan {
        &self.inner.plan
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.inner.storage
    }

    // ==================== Install ====================

    /// Precache the current generation.
    ///
    /// Required assets are stored as one batch: a single failure stores
    /// nothing and fails the install. If the generation did not exist
    /// before, it is removed again so no half-built generation is left.
    /// Best-effort assets are attempted one by one afterwards and never fail
    /// the install.
    pub async fn install(&self, host: &dyn LifecycleHost) -> Result<InstallReport, SwError> {
        let inner = &self.inner;
        let name = inner.cache_name.as_str();
        info!(cache = %name, "Installing");

        let existed = inner.storage.has(name).await?;
        let cache = inner.storage.open(name).await?;

        let required: Vec<Request> = inner.plan.required.iter().cloned().map(Request::get).collect();
        if let Err(source) = cache.add_all(inner.fetcher.as_ref(), &required).await {
            warn!(cache = %name, error = %source, "Required assets failed, install aborted");
            if !existed {
                if let Err(e) = inner.storage.delete(name).await {
                    warn!(cache = %name, error = %e, "Could not remove failed generation");
                }
            }
            return Err(SwError::Install {
                cache_name: name.to_string(),
                source,
            });
        }

        let best_effort = join_all(
            inner
                .plan
                .best_effort
                .iter()
                .map(|url| add_best_effort(cache.as_ref(), inner.fetcher.as_ref(), url)),
        )
        .await;

        host.skip_waiting();

        let report = InstallReport {
            cache_name: name.to_string(),
            required: inner.plan.required.iter().map(|u| u.to_string()).collect(),
            best_effort,
        };
        info!(
            cache = %name,
            required = report.required.len(),
            best_effort_ok = report.best_effort.iter().filter(|o| o.is_ok()).count(),
            best_effort_failed = report.best_effort.iter().filter(|o| !o.is_ok()).count(),
            "Installed"
        );
        Ok(report)
    }

    // ==================== Activate ====================

    /// Delete every generation except the current one and claim clients.
    ///
    /// The claim runs concurrently with the deletions. Each deletion is
    /// independent; failures are logged and reported, never propagated.
    pub async fn activate(&self, host: &dyn LifecycleHost) -> ActivateReport {
        let name = self.inner.cache_name.clone();
        info!(cache = %name, "Activating");

        let (cleanup, claim) = tokio::join!(self.delete_stale_generations(), host.claim_clients());

        let mut report = ActivateReport {
            cache_name: name,
            ..Default::default()
        };
        match cleanup {
            Ok(outcomes) => {
                for (stale, outcome) in outcomes {
                    match outcome {
                        Ok(()) => report.deleted.push(stale),
                        Err(reason) => report.failed_deletions.push((stale, reason)),
                    }
                }
            }
            Err(reason) => report.list_error = Some(reason),
        }
        match claim {
            Ok(count) => report.clients_claimed = count,
            Err(e) => {
                warn!(error = %e, "Claiming clients failed");
                report.claim_error = Some(e.to_string());
            }
        }

        info!(
            cache = %report.cache_name,
            deleted = report.deleted.len(),
            failed = report.failed_deletions.len(),
            clients = report.clients_claimed,
            "Activated"
        );
        report
    }

    /// Per-generation deletion outcomes, or why the names could not be listed.
    async fn delete_stale_generations(&self) -> Result<Vec<(String, Result<(), String>)>, String> {
        let storage = &self.inner.storage;
        let current = self.inner.cache_name.as_str();

        let names = storage.keys().await.map_err(|e| {
            warn!(error = %e, "Could not list cache generations");
            e.to_string()
        })?;

        let stale = names.into_iter().filter(|n| n != current);
        let outcomes = join_all(stale.map(|name| async move {
            let outcome = match storage.delete(&name).await {
                Ok(_) => {
                    debug!(cache = %name, "Deleted stale generation");
                    Ok(())
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Could not delete stale generation");
                    Err(e.to_string())
                }
            };
            (name, outcome)
        }))
        .await;
        Ok(outcomes)
    }

    // ==================== Fetch ====================

    /// Decide whether the worker owns `request`.
    ///
    /// Only GET requests to `http`/`https` URLs are owned. The decision is
    /// made here, synchronously; the response itself is deferred.
    pub fn handle_fetch(&self, request: Request) -> FetchDecision {
        if request.method != Method::GET || !request.has_network_scheme() {
            trace!(url = %request.url, method = %request.method, "Passing through");
            return FetchDecision::PassThrough;
        }
        let inner = Arc::clone(&self.inner);
        FetchDecision::Owned(Box::pin(async move { inner.respond(request).await }))
    }

    /// Wait for every background cache write started so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.inner.pending_writes.lock().await);
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Background cache write did not finish");
            }
        }
    }
}

async fn add_best_effort(cache: &dyn Cache, fetcher: &dyn Fetcher, url: &url::Url) -> AssetOutcome {
    let request = Request::get(url.clone());
    match cache.add(fetcher, &request).await {
        Ok(()) => AssetOutcome {
            url: url.to_string(),
            error: None,
        },
        Err(e) => {
            warn!(url = %url, error = %e, "Best-effort asset skipped");
            AssetOutcome {
                url: url.to_string(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Only complete, visible, 200 responses go into the cache.
fn is_storable(response: &Response) -> bool {
    response.status == 200
        && !matches!(response.response_type, ResponseType::Opaque | ResponseType::Error)
}

impl Inner {
    /// The current generation, if it exists. Reads never create it.
    async fn current_cache(&self) -> Option<Arc<dyn Cache>> {
        let opened = match self.storage.has(&self.cache_name).await {
            Ok(false) => {
                trace!(cache = %self.cache_name, "Generation not created yet");
                return None;
            }
            Ok(true) => self.storage.open(&self.cache_name).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(cache = %self.cache_name, error = %e, "Could not open cache");
                None
            }
        }
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let cache = self.current_cache().await?;
        match cache.match_request(request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn respond(self: Arc<Self>, request: Request) -> Result<Served, SwError> {
        if let Some(response) = self.lookup(&request).await {
            debug!(url = %request.url, "Served from cache");
            return Ok(Served {
                response,
                source: ResponseSource::Cache,
            });
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if is_storable(&response) {
                    self.store_in_background(request.clone(), response.duplicate())
                        .await;
                }
                debug!(url = %request.url, status = response.status, "Served from network");
                Ok(Served {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(source) => {
                if request.is_navigation() {
                    let shell = Request::get(self.plan.shell.clone());
                    if let Some(response) = self.lookup(&shell).await {
                        info!(url = %request.url, "Offline, serving shell page");
                        return Ok(Served {
                            response,
                            source: ResponseSource::OfflineFallback,
                        });
                    }
                }
                debug!(url = %request.url, error = %source, "Network failed, no response");
                Err(SwError::Network {
                    url: request.url.to_string(),
                    source,
                })
            }
        }
    }

    /// Write `response` into the current generation without blocking the
    /// requester.
    async fn store_in_background(&self, request: Request, response: Response) {
        let storage = Arc::clone(&self.storage);
        let name = self.cache_name.clone();

        let mut pending = self.pending_writes.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            let written = match storage.open(&name).await {
                Ok(cache) => cache.put(&request, response).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => trace!(cache = %name, url = %request.url, "Cached network response"),
                Err(e) => warn!(cache = %name, url = %request.url, error = %e, "Cache write failed"),
            }
        });
    }
}
