//! End-to-end lifecycle tests for the offline cache worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, RwLock};
use url::Url;

use swkit_common::{init_logging, LogConfig, OptionExt};
use swkit_net::{Fetcher, NetError, Request, Response, ResponseKind};
use swkit_sw::{
    CacheStorage, CacheWorker, Client, Clients, FetchOutcome, WorkerConfig, WorkerEvent,
    WorkerState,
};

fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| init_logging(LogConfig::default().with_filter("warn")));
}

#[derive(Clone)]
struct Canned {
    status: u16,
    kind: ResponseKind,
    body: &'static str,
}

/// Scripted network: serves canned responses and records every call.
#[derive(Default)]
struct MockFetcher {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn serve(&self, url: &str, status: u16, kind: ResponseKind, body: &'static str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Canned { status, kind, body });
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.as_str().to_string();
        self.calls.lock().unwrap().push(url.clone());

        let canned = self
            .responses
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| NetError::RequestFailed(format!("unreachable: {}", url)))?;

        Ok(Response {
            request_id: request.id,
            url: request.url,
            status: StatusCode::from_u16(canned.status).unwrap(),
            headers: HeaderMap::new(),
            kind: canned.kind,
            body: Bytes::from(canned.body),
        })
    }
}

fn config(cache_name: &str, seeds: &[&str]) -> WorkerConfig {
    WorkerConfig {
        cache_name: cache_name.to_string(),
        origin: "https://biozen.app".to_string(),
        precache_paths: seeds.iter().map(|s| s.to_string()).collect(),
        api_marker: "/api/".to_string(),
    }
}

fn make_worker(
    config: WorkerConfig,
    storage: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<MockFetcher>,
) -> (
    CacheWorker,
    mpsc::UnboundedReceiver<WorkerEvent>,
    Arc<RwLock<Clients>>,
) {
    init_test_logging();
    let clients = Arc::new(RwLock::new(Clients::new()));
    let (worker, events) =
        CacheWorker::new(config, storage, Arc::clone(&clients), fetcher).unwrap();
    (worker, events, clients)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn get_request(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
}

#[tokio::test]
async fn install_seeds_every_asset() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 200, ResponseKind::Basic, "<html/>");
    fetcher.serve("https://biozen.app/logo.svg", 200, ResponseKind::Basic, "<svg/>");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) = make_worker(
        config("v1", &["/", "/logo.svg"]),
        Arc::clone(&storage),
        fetcher,
    );

    worker.handle_install().await.unwrap();

    assert_eq!(worker.state().await, WorkerState::Installed);
    assert_eq!(worker.config().cache_name, "v1");
    assert!(worker.take_skip_waiting());

    let storage = storage.read().await;
    let cache = storage.get("v1").unwrap();
    let mut keys = cache.keys();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["https://biozen.app/", "https://biozen.app/logo.svg"]
    );
    assert!(cache.match_request("https://biozen.app/").is_some());
}

#[tokio::test]
async fn install_fails_atomically_when_a_seed_is_unreachable() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 200, ResponseKind::Basic, "<html/>");
    // "/logo.svg" is not served: the second seed fetch fails.

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) = make_worker(
        config("v1", &["/", "/logo.svg"]),
        Arc::clone(&storage),
        fetcher,
    );

    let err = worker.handle_install().await.unwrap_err();
    assert_eq!(err.category(), "install");
    assert_eq!(worker.state().await, WorkerState::Redundant);
    assert!(!worker.take_skip_waiting());

    // No partially-seeded store is left behind.
    assert!(!storage.read().await.has("v1"));
}

#[tokio::test]
async fn install_fails_on_non_success_seed_response() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 500, ResponseKind::Basic, "");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v1", &["/"]), Arc::clone(&storage), fetcher);

    let err = worker.handle_install().await.unwrap_err();
    assert_eq!(err.category(), "install");
    assert!(!storage.read().await.has("v1"));
}

#[tokio::test]
async fn activate_deletes_every_stale_generation() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 200, ResponseKind::Basic, "<html/>");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    {
        // A previous deployment left its generation behind.
        let mut storage = storage.write().await;
        storage.open("v1");
    }

    let (worker, mut events, _clients) =
        make_worker(config("v2", &["/"]), Arc::clone(&storage), fetcher);

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    assert_eq!(worker.state().await, WorkerState::Activated);

    let storage = storage.read().await;
    assert_eq!(storage.keys(), vec!["v2"]);
    // The live store survives the sweep intact.
    assert_eq!(storage.get("v2").unwrap().len(), 1);

    let deleted: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            WorkerEvent::StaleCacheDeleted { name } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, vec!["v1".to_string()]);
}

#[tokio::test]
async fn cached_asset_is_served_without_network() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 200, ResponseKind::Basic, "<html/>");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &["/"]), Arc::clone(&storage), fetcher.clone());

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();
    let seed_calls = fetcher.total_calls();

    let outcome = worker.handle_fetch(get_request("https://biozen.app/")).await.unwrap();

    match outcome {
        FetchOutcome::Cached(response) => {
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.text().unwrap(), "<html/>");
        }
        other => panic!("expected cached response, got {:?}", other),
    }
    assert_eq!(fetcher.total_calls(), seed_calls);
}

#[tokio::test]
async fn asset_miss_is_fetched_and_written_through() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/logo.svg", 200, ResponseKind::Basic, "<svg/>");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher.clone());

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    // First request misses and goes to the network.
    let outcome = worker
        .handle_fetch(get_request("https://biozen.app/logo.svg"))
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Network(_)));
    assert_eq!(
        outcome.response().unwrap().text().unwrap(),
        "<svg/>"
    );

    {
        let storage = storage.read().await;
        let cache = storage.get("v2").unwrap();
        assert!(cache.match_request("https://biozen.app/logo.svg").is_some());
    }

    // The second identical request is answered from the store.
    let outcome = worker
        .handle_fetch(get_request("https://biozen.app/logo.svg"))
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Cached(_)));
    assert_eq!(fetcher.calls_for("https://biozen.app/logo.svg"), 1);
}

#[tokio::test]
async fn non_success_and_cross_origin_responses_are_not_cached() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/missing.html", 404, ResponseKind::Basic, "");
    fetcher.serve("https://cdn.example/font.woff2", 200, ResponseKind::Opaque, "");

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let outcome = worker
        .handle_fetch(get_request("https://biozen.app/missing.html"))
        .await
        .unwrap();
    assert_eq!(outcome.response().unwrap().status, StatusCode::NOT_FOUND);

    let outcome = worker
        .handle_fetch(get_request("https://cdn.example/font.woff2"))
        .await
        .unwrap();
    assert_eq!(outcome.response().unwrap().kind, ResponseKind::Opaque);

    let storage = storage.read().await;
    assert!(storage.get("v2").unwrap().is_empty());
}

#[tokio::test]
async fn api_requests_bypass_the_cache_entirely() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/", 200, ResponseKind::Basic, "<html/>");
    fetcher.serve(
        "https://biozen.app/api/measurements",
        200,
        ResponseKind::Basic,
        "fresh",
    );

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &["/"]), Arc::clone(&storage), fetcher.clone());

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let before = storage.read().await.get("v2").unwrap().len();

    let outcome = worker
        .handle_fetch(get_request("https://biozen.app/api/measurements"))
        .await
        .unwrap();

    // Served by the network even though a 200/basic response came back.
    match outcome {
        FetchOutcome::Network(response) => assert_eq!(response.text().unwrap(), "fresh"),
        other => panic!("expected network response, got {:?}", other),
    }
    assert_eq!(fetcher.calls_for("https://biozen.app/api/measurements"), 1);

    // Repeated API requests keep hitting the network.
    worker
        .handle_fetch(get_request("https://biozen.app/api/measurements"))
        .await
        .unwrap();
    assert_eq!(fetcher.calls_for("https://biozen.app/api/measurements"), 2);

    // The store is unchanged before and after.
    let storage = storage.read().await;
    assert_eq!(storage.get("v2").unwrap().len(), before);
    assert!(storage
        .get("v2")
        .unwrap()
        .match_request("https://biozen.app/api/measurements")
        .is_none());
}

#[tokio::test]
async fn non_http_schemes_are_left_to_the_host() {
    let fetcher = Arc::new(MockFetcher::new());

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher.clone());

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let outcome = worker
        .handle_fetch(get_request("chrome-extension://abc/page.html"))
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Ignored));
    assert!(outcome.response().is_none());
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn network_failure_with_no_cache_entry_propagates() {
    let fetcher = Arc::new(MockFetcher::new());

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let err = worker
        .handle_fetch(get_request("https://biozen.app/ghost.js"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "network");
}

#[tokio::test]
async fn cache_write_failure_does_not_affect_the_response() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.serve("https://biozen.app/logo.svg", 200, ResponseKind::Basic, "<svg/>");

    // A zero-entry quota makes every write fail.
    let storage = Arc::new(RwLock::new(CacheStorage::with_entry_limit(0)));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let outcome = worker
        .handle_fetch(get_request("https://biozen.app/logo.svg"))
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Network(_)));
    assert_eq!(outcome.response().unwrap().status, StatusCode::OK);
    assert!(storage.read().await.get("v2").unwrap().is_empty());
}

#[tokio::test]
async fn fetch_is_rejected_until_activation() {
    let fetcher = Arc::new(MockFetcher::new());

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, _events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    let err = worker
        .handle_fetch(get_request("https://biozen.app/"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "state");

    worker.handle_install().await.unwrap();
    let err = worker
        .handle_fetch(get_request("https://biozen.app/"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "state");
}

#[tokio::test]
async fn activation_claims_open_pages() {
    let fetcher = Arc::new(MockFetcher::new());

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, mut events, clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    let page_id = {
        let mut clients = clients.write().await;
        let page = Client::new(Url::parse("https://biozen.app/trends").unwrap());
        let id = page.id.clone();
        clients.add(page);
        clients.add(Client::new(Url::parse("https://biozen.app/").unwrap()));
        id
    };

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let clients = clients.read().await;
    assert_eq!(clients.controlled_count(), 2);
    let page = clients.get(&page_id).ok_or_not_found(page_id.as_str()).unwrap();
    assert!(page.controlled);

    let claimed: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            WorkerEvent::ClientsClaimed { count } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(claimed, vec![2]);
}

#[tokio::test]
async fn lifecycle_emits_state_changes_in_order() {
    let fetcher = Arc::new(MockFetcher::new());

    let storage = Arc::new(RwLock::new(CacheStorage::new()));
    let (worker, mut events, _clients) =
        make_worker(config("v2", &[]), Arc::clone(&storage), fetcher);

    worker.handle_install().await.unwrap();
    worker.handle_activate().await.unwrap();

    let transitions: Vec<(WorkerState, WorkerState)> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            WorkerEvent::StateChange { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();

    assert_eq!(
        transitions,
        vec![
            (WorkerState::Parsed, WorkerState::Installing),
            (WorkerState::Installing, WorkerState::Installed),
            (WorkerState::Installed, WorkerState::Activating),
            (WorkerState::Activating, WorkerState::Activated),
        ]
    );
}
