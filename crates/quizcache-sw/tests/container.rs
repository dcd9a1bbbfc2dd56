mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use quizcache_common::RetryConfig;
use quizcache_net::{Fetcher, NetError, Request, Response};
use quizcache_sw::{
    CacheStorage, MemoryCacheStorage, OfflineCacheManager, ResponseSource, ServiceWorkerContainer,
    ServiceWorkerEvent, ServiceWorkerState, WorkerConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

fn container() -> (ServiceWorkerContainer, UnboundedReceiver<ServiceWorkerEvent>) {
    ServiceWorkerContainer::new(Url::parse(SCOPE).unwrap())
}

fn drain(rx: &mut UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn v2() -> WorkerConfig {
    WorkerConfig {
        cache_name: "drone-quiz-v2".to_string(),
        ..config()
    }
}

#[tokio::test]
async fn requests_pass_through_until_a_worker_is_active() {
    let (container, _events) = container();
    let request = Request::parse(&url("drone_quiz.html")).unwrap();
    assert!(!container.dispatch_fetch(request).await.is_owned());
}

#[tokio::test]
async fn first_registration_installs_and_activates() {
    let (container, mut events) = container();
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = FakeNetwork::serving_app();

    let outcome = container
        .register(manager(&config(), storage.clone(), network.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.install.cache_name, "drone-quiz-v1");
    assert!(outcome.activate.is_some());
    let active = container.active_worker().await.unwrap();
    assert_eq!(active.id, outcome.worker_id);
    assert_eq!(active.state, ServiceWorkerState::Activated);
    assert!(container.waiting_worker().await.is_none());

    let states: Vec<ServiceWorkerState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );

    let before = network.total_hits();
    let request = Request::parse(&url("icon-512.png")).unwrap();
    match container.dispatch_fetch(request).await {
        quizcache_sw::FetchDecision::Owned(response) => {
            assert_eq!(response.await.unwrap().source, ResponseSource::Cache);
        }
        other => panic!("expected owned response, got {other:?}"),
    }
    assert_eq!(network.total_hits(), before);
}

#[tokio::test]
async fn new_generation_replaces_the_old_one() {
    let (container, mut events) = container();
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = FakeNetwork::serving_app();

    let first = container
        .register(manager(&config(), storage.clone(), network.clone()))
        .await
        .unwrap();
    drain(&mut events);

    let second = container
        .register(manager(&v2(), storage.clone(), network))
        .await
        .unwrap();

    let report = second.activate.unwrap();
    assert_eq!(report.deleted, vec!["drone-quiz-v1"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["drone-quiz-v2".to_string()]);
    assert_eq!(container.active_worker().await.unwrap().cache_name, "drone-quiz-v2");
    assert_eq!(
        container.active_manager().await.unwrap().cache_name(),
        "drone-quiz-v2"
    );

    let old_retired = drain(&mut events).into_iter().any(|e| {
        matches!(
            e,
            ServiceWorkerEvent::StateChange { worker_id, new_state: ServiceWorkerState::Redundant }
                if worker_id == first.worker_id
        )
    });
    assert!(old_retired);
}

#[tokio::test]
async fn failed_install_keeps_the_active_worker() {
    let (container, mut events) = container();
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = FakeNetwork::serving_app();
    let first = container
        .register(manager(&config(), storage.clone(), network.clone()))
        .await
        .unwrap();
    drain(&mut events);

    network.down(&url("manifest.json"));
    let err = container
        .register(manager(&v2(), storage.clone(), network))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("drone-quiz-v2"));

    assert_eq!(container.active_worker().await.unwrap().id, first.worker_id);
    assert!(!storage.has("drone-quiz-v2").await.unwrap());
    assert!(storage.has("drone-quiz-v1").await.unwrap());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ServiceWorkerEvent::InstallFailed { .. })));
}

#[tokio::test]
async fn activation_claims_open_pages() {
    let (container, mut events) = container();
    let page = container
        .clients()
        .write()
        .await
        .open(Url::parse(&url("drone_quiz.html")).unwrap());
    let outside = container
        .clients()
        .write()
        .await
        .open(Url::parse("https://elsewhere.test/").unwrap());

    let outcome = container
        .register(manager(
            &config(),
            Arc::new(MemoryCacheStorage::new()),
            FakeNetwork::serving_app(),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.activate.unwrap().clients_claimed, 1);
    let clients = container.clients();
    let clients = clients.read().await;
    assert_eq!(clients.get(&page).unwrap().controller, Some(outcome.worker_id));
    assert_eq!(clients.get(&outside).unwrap().controller, None);

    let changes: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ServiceWorkerEvent::ControllerChange { client_id, .. } => Some(client_id),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![page]);
}

/// Fails every request until `failures` attempts have been made.
struct ComesOnline {
    inner: Arc<FakeNetwork>,
    failures: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl Fetcher for ComesOnline {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(NetError::RequestFailed("connection reset".into()));
        }
        self.inner.fetch(request).await
    }
}

fn quick_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        jitter: false,
        ..RetryConfig::attempts(attempts)
    }
}

#[tokio::test]
async fn register_with_retry_survives_transient_failures() {
    let (container, _events) = container();
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
    let network = Arc::new(ComesOnline {
        inner: FakeNetwork::serving_app(),
        failures: 1,
        seen: AtomicUsize::new(0),
    });
    let manager = OfflineCacheManager::new(&config(), storage, network).unwrap();

    let outcome = container
        .register_with_retry(manager, &quick_retry(3))
        .await
        .unwrap();

    assert!(outcome.activate.is_some());
    assert!(container.active_worker().await.is_some());
}

#[tokio::test]
async fn register_with_retry_does_not_retry_missing_assets() {
    let (container, mut events) = container();
    let network = FakeNetwork::serving_app();
    network.respond(&url("icon-192.png"), 404, "", Default::default());

    let result = container
        .register_with_retry(
            manager(&config(), Arc::new(MemoryCacheStorage::new()), network.clone()),
            &quick_retry(3),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(network.hits(&url("icon-192.png")), 1, "a 404 is not retried");
    let failures = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ServiceWorkerEvent::InstallFailed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert!(container.active_worker().await.is_none());
}
