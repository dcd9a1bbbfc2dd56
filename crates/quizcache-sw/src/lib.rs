//! # quizcache service worker
//!
//! Offline availability for the drone quiz single-page app.
//!
//! ## Features
//!
//! - **Install**: precache the app shell as one atomic batch, third-party
//!   assets (web fonts) best-effort
//! - **Activate**: delete every stale cache generation, claim open clients
//! - **Fetch**: cache-first for GET `http(s)` requests, network fallback that
//!   fills the cache, shell page for offline navigations
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     ├── Clients
//!     └── OfflineCacheManager (one per installed worker)
//!             ├── WorkerConfig / AssetPlan
//!             ├── CacheStorage ──▶ Cache (one per generation)
//!             └── Fetcher
//! ```

use quizcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod lifecycle;
pub mod manager;

pub use cache::{Cache, CacheEntry, CacheError, CacheStorage, MemoryCache, MemoryCacheStorage, StorageSnapshot};
pub use clients::{Client, ClientId, Clients};
pub use config::{AssetPlan, WorkerConfig};
pub use container::{RegisterOutcome, ServiceWorkerContainer, ServiceWorkerEvent};
pub use lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use manager::{
    ActivateReport, AssetOutcome, FetchDecision, InstallReport, LifecycleHost,
    OfflineCacheManager, ResponseFuture, ResponseSource, Served,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    /// A required asset could not be precached. Nothing was switched.
    #[error("Install of {cache_name} failed: {source}")]
    Install {
        cache_name: String,
        #[source]
        source: CacheError,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Network failure with no offline fallback.
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] quizcache_common::Error),
}

impl SwError {
    /// Whether a host should retry the phase that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SwError::Install { source, .. } | SwError::Cache(source) => source.is_retryable(),
            SwError::Network { source, .. } => source.is_retryable(),
            SwError::State(_) | SwError::NotFound(_) | SwError::Config(_) => false,
        }
    }
}
