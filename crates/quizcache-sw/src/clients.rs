//! Clients: the open pages a worker can control.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::lifecycle::ServiceWorkerId;

/// Client ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client (an open page of the quiz app).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    pub url: Url,

    /// Worker currently controlling this page, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened page. It starts uncontrolled.
    pub fn open(&mut self, url: Url) -> ClientId {
        let id = ClientId::next();
        self.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                url,
                controller: None,
            },
        );
        id
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients inside `scope`, optionally only those already controlled by `worker`.
    pub fn match_all(&self, scope: &Url, controlled_by: Option<ServiceWorkerId>) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| controlled_by.map_or(true, |w| c.controller == Some(w)))
            .collect()
    }

    /// Make `worker` the controller of every client in `scope`.
    ///
    /// Returns the clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<ClientId> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }
}
