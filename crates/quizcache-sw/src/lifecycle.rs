//! Worker lifecycle state machine.
//!
//! ```text
//! Parsed ──install──▶ Installing ──ok──▶ Installed ──▶ Activating ──▶ Activated
//!                         │                                              │
//!                         └──err──▶ Redundant ◀──────── replaced ────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use url::Url;

use crate::SwError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and receiving fetches.
    Activated,
    /// Install failed or replaced by a newer worker.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        ) && self != Redundant
    }
}

/// A service worker instance as tracked by the host.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    /// Cache generation this worker installs.
    pub cache_name: String,

    pub state: ServiceWorkerState,

    /// Set once the install handler asked to skip the waiting phase.
    pub skip_waiting: bool,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Move to `state`, rejecting transitions the lifecycle does not allow.
    pub fn set_state(&mut self, state: ServiceWorkerState) -> Result<(), SwError> {
        if !self.state.can_transition_to(state) {
            return Err(SwError::State(format!(
                "worker {} cannot go from {:?} to {:?}",
                self.id.raw(),
                self.state,
                state
            )));
        }
        self.state = state;
        self.state_changed_at = Instant::now();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,

    pub installing: Option<ServiceWorker>,

    /// Installed but not yet active.
    pub waiting: Option<ServiceWorker>,

    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Start installing a new worker. A previous installing worker is
    /// discarded.
    pub fn begin_install(&mut self, cache_name: &str) -> Result<ServiceWorkerId, SwError> {
        if let Some(mut stale) = self.installing.take() {
            stale.set_state(ServiceWorkerState::Redundant)?;
        }
        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Installing)?;
        let id = worker.id;
        self.installing = Some(worker);
        Ok(id)
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self, skip_waiting: bool) -> Result<(), SwError> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| SwError::State("no installing worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Installed)?;
        worker.skip_waiting = skip_waiting;
        if let Some(mut replaced) = self.waiting.take() {
            replaced.set_state(ServiceWorkerState::Redundant)?;
        }
        self.waiting = Some(worker);
        Ok(())
    }

    /// Install failed; the installing worker becomes redundant.
    pub fn install_failed(&mut self, error: &str) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error.to_string());
        worker.state = ServiceWorkerState::Redundant;
        worker.state_changed_at = Instant::now();
        Some(worker)
    }

    /// Whether the waiting worker may activate now: it asked to skip
    /// waiting, or nothing is active.
    pub fn can_activate(&self) -> bool {
        match self.waiting {
            Some(ref worker) => worker.skip_waiting || self.active.is_none(),
            None => false,
        }
    }

    /// Move the waiting worker into `Activating`. The old active worker
    /// becomes redundant.
    pub fn begin_activate(&mut self) -> Result<ServiceWorkerId, SwError> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| SwError::State("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating)?;

        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant)?;
        }

        let id = worker.id;
        self.active = Some(worker);
        Ok(id)
    }

    /// Activate handler finished.
    pub fn activate_complete(&mut self) -> Result<(), SwError> {
        let worker = self
            .active
            .as_mut()
            .ok_or_else(|| SwError::State("no activating worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activated)
    }

    /// Get the active worker, once fully activated.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }
}
