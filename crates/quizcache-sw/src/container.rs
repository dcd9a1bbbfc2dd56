//! Host side: runs the lifecycle and routes fetches to the active worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use quizcache_common::{retry_when, RetryConfig};
use quizcache_net::Request;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientId, Clients};
use crate::lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::manager::{ActivateReport, FetchDecision, InstallReport, LifecycleHost, OfflineCacheManager};
use crate::SwError;

/// Events emitted by the container.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Install failed; the worker is redundant.
    InstallFailed {
        worker_id: ServiceWorkerId,
        error: String,
    },
    /// Controller changed.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

/// What `register` did.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub worker_id: ServiceWorkerId,
    pub install: InstallReport,
    /// `None` when the new worker is left waiting.
    pub activate: Option<ActivateReport>,
}

/// Service worker container for one scope.
pub struct ServiceWorkerContainer {
    scope: Url,

    registration: RwLock<ServiceWorkerRegistration>,

    /// Installed workers by ID.
    workers: RwLock<HashMap<ServiceWorkerId, OfflineCacheManager>>,

    clients: Arc<RwLock<Clients>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope.clone())),
                scope,
                workers: RwLock::new(HashMap::new()),
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Shared clients registry.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn host_for(&self, worker_id: ServiceWorkerId) -> WorkerHost {
        WorkerHost {
            worker_id,
            scope: self.scope.clone(),
            clients: Arc::clone(&self.clients),
            skip_waiting: AtomicBool::new(false),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Install `manager` as a new worker, then activate it if it asked to
    /// skip waiting or nothing is active yet.
    pub async fn register(&self, manager: OfflineCacheManager) -> Result<RegisterOutcome, SwError> {
        let worker_id = self
            .registration
            .write()
            .await
            .begin_install(manager.cache_name())?;
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state: ServiceWorkerState::Installing,
        });

        let host = self.host_for(worker_id);
        let install = match manager.install(&host).await {
            Ok(report) => report,
            Err(e) => {
                warn!(worker = worker_id.raw(), error = %e, "Install failed");
                self.registration.write().await.install_failed(&e.to_string());
                self.emit(ServiceWorkerEvent::InstallFailed {
                    worker_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (can_activate, replaced) = {
            let mut registration = self.registration.write().await;
            let replaced = registration.waiting.as_ref().map(|w| w.id);
            registration.install_complete(host.skip_waiting_requested())?;
            (registration.can_activate(), replaced)
        };
        {
            let mut workers = self.workers.write().await;
            if let Some(old) = replaced {
                workers.remove(&old);
            }
            workers.insert(worker_id, manager);
        }
        if let Some(old) = replaced {
            self.emit(ServiceWorkerEvent::StateChange {
                worker_id: old,
                new_state: ServiceWorkerState::Redundant,
            });
        }
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state: ServiceWorkerState::Installed,
        });

        let activate = if can_activate {
            Some(self.activate_waiting().await?)
        } else {
            info!(worker = worker_id.raw(), "Installed worker is waiting");
            None
        };

        Ok(RegisterOutcome {
            worker_id,
            install,
            activate,
        })
    }

    /// `register`, retrying retryable install failures with backoff.
    pub async fn register_with_retry(
        &self,
        manager: OfflineCacheManager,
        retry: &RetryConfig,
    ) -> Result<RegisterOutcome, SwError> {
        retry_when(retry, || self.register(manager.clone()), SwError::is_retryable).await
    }

    /// Activate the waiting worker.
    pub async fn activate_waiting(&self) -> Result<ActivateReport, SwError> {
        let (worker_id, replaced) = {
            let mut registration = self.registration.write().await;
            let replaced = registration.active.as_ref().map(|w| w.id);
            (registration.begin_activate()?, replaced)
        };

        if let Some(old) = replaced {
            self.workers.write().await.remove(&old);
            self.emit(ServiceWorkerEvent::StateChange {
                worker_id: old,
                new_state: ServiceWorkerState::Redundant,
            });
        }
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state: ServiceWorkerState::Activating,
        });

        let manager = self
            .workers
            .read()
            .await
            .get(&worker_id)
            .cloned()
            .ok_or_else(|| SwError::NotFound(format!("worker {}", worker_id.raw())))?;

        let report = manager.activate(&self.host_for(worker_id)).await;

        self.registration.write().await.activate_complete()?;
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state: ServiceWorkerState::Activated,
        });

        Ok(report)
    }

    /// Snapshot of the fully activated worker.
    pub async fn active_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.get_active().cloned()
    }

    /// Snapshot of the waiting worker.
    pub async fn waiting_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    /// Manager of the fully activated worker.
    pub async fn active_manager(&self) -> Option<OfflineCacheManager> {
        let id = self.registration.read().await.get_active()?.id;
        self.workers.read().await.get(&id).cloned()
    }

    /// Route a request to the active worker. Until a worker is activated
    /// every request passes through.
    pub async fn dispatch_fetch(&self, request: Request) -> FetchDecision {
        match self.active_manager().await {
            Some(manager) => manager.handle_fetch(request),
            None => {
                debug!(url = %request.url, "No active worker");
                FetchDecision::PassThrough
            }
        }
    }
}

/// Lifecycle hooks handed to one worker.
struct WorkerHost {
    worker_id: ServiceWorkerId,
    scope: Url,
    clients: Arc<RwLock<Clients>>,
    skip_waiting: AtomicBool,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl WorkerHost {
    fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LifecycleHost for WorkerHost {
    fn skip_waiting(&self) {
        debug!(worker = self.worker_id.raw(), "skipWaiting");
        self.skip_waiting.store(true, Ordering::Release);
    }

    async fn claim_clients(&self) -> Result<usize, SwError> {
        let claimed = self
            .clients
            .write()
            .await
            .claim(&self.scope, self.worker_id);
        for client_id in &claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.worker_id,
            });
        }
        debug!(worker = self.worker_id.raw(), claimed = claimed.len(), "Clients claimed");
        Ok(claimed.len())
    }
}
