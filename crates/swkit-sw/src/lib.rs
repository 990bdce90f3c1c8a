//! # SwKit Service Worker
//!
//! Offline asset cache worker for the SwKit runtime.
//!
//! ## Features
//!
//! - **Lifecycle**: install, fetch, activate handlers driven by the host
//! - **Versioned stores**: exactly one cache generation is live; stale
//!   generations are deleted wholesale at activation
//! - **Cache-first assets**: cached responses are served without a network
//!   round-trip; misses are fetched and written through best-effort
//! - **API passthrough**: dynamic requests never touch a cache store
//! - **Clients**: open pages are claimed after activation, no reload needed
//!
//! ## Architecture
//!
//! ```text
//! CacheWorker
//!     ├── WorkerConfig (generation, seed paths, API marker)
//!     ├── CacheStorage (host-provided)
//!     │       └── Cache ("biozen-v3")
//!     │               └── URL → CacheEntry
//!     ├── Clients (host-provided)
//!     └── Fetcher (network seam)
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use swkit_common::{Result, SwKitError};
use swkit_net::{Fetcher, Request, RequestId, Response, ResponseKind};

// ==================== Configuration ====================

/// Offline cache worker configuration.
///
/// Fixed at worker construction. Deploying a new worker with a different
/// `cache_name` is the entire invalidation protocol: the old generation is
/// deleted wholesale at activation, there is no per-entry expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the live cache generation (e.g. "biozen-v3").
    pub cache_name: String,

    /// Origin the worker serves; seed paths resolve against it.
    pub origin: String,

    /// Asset paths cached at install time, all-or-nothing.
    pub precache_paths: Vec<String>,

    /// Requests whose URL contains this marker always bypass the cache.
    pub api_marker: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: "biozen-v3".to_string(),
            origin: "https://biozen.app".to_string(),
            precache_paths: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/logo.svg".to_string(),
                "/manifest.json".to_string(),
            ],
            api_marker: "/api/".to_string(),
        }
    }
}

// ==================== Request Classification ====================

/// Routing decision for one intercepted request.
///
/// Every request falls into exactly one class, determined only by URL
/// scheme and path content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Non-HTTP scheme (extension pages, data URIs); the worker stays out.
    NonHttp,
    /// Dynamic API request; always forwarded to the network, never cached.
    Api,
    /// Static asset; cache-first with network fallback.
    Asset,
}

impl WorkerConfig {
    /// Classify a request URL.
    pub fn classify(&self, url: &Url) -> RequestClass {
        match url.scheme() {
            "http" | "https" => {
                if url.as_str().contains(&self.api_marker) {
                    RequestClass::Api
                } else {
                    RequestClass::Asset
                }
            }
            _ => RequestClass::NonHttp,
        }
    }
}

// ==================== Cache ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response URL (final, after redirects).
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Response typing at the time it was stored.
    pub kind: ResponseKind,

    /// Stored-at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response into a storable entry.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            kind: response.kind,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self, request_id: RequestId) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| SwKitError::cache(format!("stored entry has invalid URL {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| SwKitError::cache(format!("stored entry has invalid status: {}", e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Ok(Response {
            request_id,
            url,
            status,
            headers,
            kind: self.kind,
            body: Bytes::from(self.body.clone()),
        })
    }
}

/// A single named cache store: request URL → stored response.
#[derive(Debug, Default)]
pub struct Cache {
    /// Store name (a generation identifier).
    pub name: String,

    entries: HashMap<String, CacheEntry>,
    entry_limit: Option<usize>,
}

impl Cache {
    /// Create a new unbounded cache store.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            entry_limit: None,
        }
    }

    /// Create a store that refuses writes past `limit` entries.
    pub fn with_entry_limit(name: &str, limit: usize) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            entry_limit: Some(limit),
        }
    }

    /// Match a request URL.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Store an entry under a request URL key.
    ///
    /// Fails when the store is at its entry limit, like an exhausted quota.
    pub fn put(&mut self, url: &str, entry: CacheEntry) -> Result<()> {
        if let Some(limit) = self.entry_limit {
            if self.entries.len() >= limit && !self.entries.contains_key(url) {
                return Err(SwKitError::cache(format!(
                    "store {} is full ({} entries)",
                    self.name, limit
                )));
            }
        }
        self.entries.insert(url.to_string(), entry);
        Ok(())
    }

    /// Delete an entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// Get all keys (request URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All cache stores in the worker's scope, keyed by generation name.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    entry_limit: Option<usize>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap entries per store; writes past the cap fail.
    pub fn with_entry_limit(limit: usize) -> Self {
        Self {
            caches: HashMap::new(),
            entry_limit: Some(limit),
        }
    }

    /// Open a store (creates if it doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        let limit = self.entry_limit;
        self.caches.entry(name.to_string()).or_insert_with(|| match limit {
            Some(limit) => Cache::with_entry_limit(name, limit),
            None => Cache::new(name),
        })
    }

    /// Get a store without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if a store exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a store.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all store names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }
}

// ==================== Clients ====================

/// A controlled (or controllable) page.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Page URL.
    pub url: Url,

    /// Whether this worker controls the page.
    pub controlled: bool,
}

impl Client {
    /// Create a new uncontrolled client.
    pub fn new(url: Url) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            controlled: false,
        }
    }
}

/// Registry of open pages within the worker's scope.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create a new clients registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Attach every open page to this worker without a reload.
    ///
    /// Returns the number of pages newly claimed.
    pub fn claim(&mut self) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        claimed
    }

    /// Number of pages this worker controls.
    pub fn controlled_count(&self) -> usize {
        self.clients.values().filter(|c| c.controlled).count()
    }

    /// Number of tracked pages.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if no pages are tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ==================== Worker State ====================

/// Worker lifecycle state.
///
/// Transitions are driven entirely by host-invoked handlers; the worker
/// never self-transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Script loaded, nothing run yet.
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, ready to activate.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and serving fetches.
    Activated,
    /// Install failed or worker replaced.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

impl WorkerState {
    /// Check if this state allows fetch interception.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Activated)
    }

    /// Check if the worker is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Redundant)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

// ==================== Events ====================

/// Notifications emitted as the worker moves through its lifecycle.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        from: WorkerState,
        to: WorkerState,
    },
    /// A stale cache generation was deleted during activation.
    StaleCacheDeleted { name: String },
    /// Open pages were claimed after activation.
    ClientsClaimed { count: usize },
}

// ==================== Fetch Outcome ====================

/// Result of handling one intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Non-HTTP scheme; the worker did not intervene and the host's
    /// default handling applies.
    Ignored,
    /// Served from the live cache store; no network round-trip happened.
    Cached(Response),
    /// Served from the network.
    Network(Response),
}

impl FetchOutcome {
    /// The response, if the worker produced one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Ignored => None,
            FetchOutcome::Cached(response) | FetchOutcome::Network(response) => Some(response),
        }
    }
}

// ==================== Cache Worker ====================

/// The offline asset cache worker.
///
/// Owns the caching policy; cache storage, the clients registry and the
/// network transport are host-provided collaborators. Each handler's future
/// resolves only once all I/O it triggered has completed or failed, which
/// is the host's cue that the event's work is done.
pub struct CacheWorker {
    config: WorkerConfig,
    origin: Url,
    state: RwLock<WorkerState>,
    storage: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetcher>,
    skip_waiting: AtomicBool,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl CacheWorker {
    /// Create a worker over host-provided storage, clients and transport.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| SwKitError::config(format!("invalid origin {}: {}", config.origin, e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                origin,
                state: RwLock::new(WorkerState::Parsed),
                storage,
                clients,
                fetcher,
                skip_waiting: AtomicBool::new(false),
                event_tx,
            },
            event_rx,
        ))
    }

    /// The worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Consume the skip-waiting signal raised by a successful install.
    ///
    /// When true, the host should activate this worker immediately instead
    /// of waiting for existing pages to close.
    pub fn take_skip_waiting(&self) -> bool {
        self.skip_waiting.swap(false, Ordering::SeqCst)
    }

    async fn set_state(&self, to: WorkerState) {
        let from = {
            let mut state = self.state.write().await;
            let from = *state;
            *state = to;
            from
        };
        debug!(%from, %to, "worker state change");
        let _ = self.event_tx.send(WorkerEvent::StateChange { from, to });
    }

    /// Install: seed the live store, all-or-nothing.
    ///
    /// Any failed seed fetch fails the whole step; the worker becomes
    /// redundant and no partially-seeded store is left behind. On success
    /// the skip-waiting signal is raised.
    pub async fn handle_install(&self) -> Result<()> {
        self.set_state(WorkerState::Installing).await;

        match self.seed_store().await {
            Ok(count) => {
                self.skip_waiting.store(true, Ordering::SeqCst);
                self.set_state(WorkerState::Installed).await;
                info!(store = %self.config.cache_name, seeded = count, "install complete");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    /// Fetch every seed, then populate the store only once all succeeded.
    async fn seed_store(&self) -> Result<usize> {
        let mut staged = Vec::with_capacity(self.config.precache_paths.len());
        for path in &self.config.precache_paths {
            let url = self
                .origin
                .join(path)
                .map_err(|e| SwKitError::InvalidArgument(format!("seed path {}: {}", path, e)))?;

            let response = self
                .fetcher
                .fetch(Request::get(url.clone()))
                .await
                .map_err(|e| {
                    SwKitError::install_with_source(format!("seed fetch {} failed", url), e)
                })?;

            if !response.ok() {
                return Err(SwKitError::install(format!(
                    "seed fetch {} returned {}",
                    url, response.status
                )));
            }

            trace!(url = %url, "seed fetched");
            staged.push((url.as_str().to_string(), CacheEntry::from_response(&response)));
        }

        let count = staged.len();
        let mut storage = self.storage.write().await;
        let cache = storage.open(&self.config.cache_name);
        for (url, entry) in staged {
            cache.put(&url, entry)?;
        }
        Ok(count)
    }

    /// Activate: evict every stale generation, then claim open pages.
    pub async fn handle_activate(&self) -> Result<()> {
        self.set_state(WorkerState::Activating).await;

        {
            let mut storage = self.storage.write().await;
            let stale: Vec<String> = storage
                .keys()
                .into_iter()
                .filter(|name| *name != self.config.cache_name.as_str())
                .map(String::from)
                .collect();
            for name in stale {
                storage.delete(&name);
                info!(store = %name, "deleted stale cache generation");
                let _ = self.event_tx.send(WorkerEvent::StaleCacheDeleted { name });
            }
        }

        let count = self.clients.write().await.claim();
        debug!(claimed = count, "claimed open pages");
        let _ = self.event_tx.send(WorkerEvent::ClientsClaimed { count });

        self.set_state(WorkerState::Activated).await;
        Ok(())
    }

    /// Handle one intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        let state = *self.state.read().await;
        if !state.can_intercept_fetch() {
            return Err(SwKitError::State(format!(
                "cannot intercept fetch while {}",
                state
            )));
        }

        match self.config.classify(&request.url) {
            RequestClass::NonHttp => {
                trace!(url = %request.url, "non-HTTP scheme, not intervening");
                Ok(FetchOutcome::Ignored)
            }
            RequestClass::Api => {
                trace!(url = %request.url, "API request, bypassing cache");
                let response = self
                    .fetcher
                    .fetch(request)
                    .await
                    .map_err(|e| SwKitError::network_with_source("API passthrough failed", e))?;
                Ok(FetchOutcome::Network(response))
            }
            RequestClass::Asset => self.fetch_asset(request).await,
        }
    }

    /// Cache-first asset handling with best-effort write-through.
    async fn fetch_asset(&self, request: Request) -> Result<FetchOutcome> {
        let key = request.url.as_str().to_string();

        {
            let storage = self.storage.read().await;
            if let Some(cache) = storage.get(&self.config.cache_name) {
                if let Some(entry) = cache.match_request(&key) {
                    debug!(url = %key, "cache hit");
                    let response = entry.to_response(request.id)?;
                    return Ok(FetchOutcome::Cached(response));
                }
            }
        }

        debug!(url = %key, "cache miss, fetching");
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| SwKitError::network_with_source(format!("fetch {} failed", key), e))?;

        // Only complete same-origin responses are worth keeping.
        if response.status == StatusCode::OK && response.kind == ResponseKind::Basic {
            self.put_best_effort(&key, &response).await;
        }

        Ok(FetchOutcome::Network(response))
    }

    /// Write a response into the live store.
    ///
    /// A failed write is logged and swallowed; the response already on its
    /// way to the page is unaffected.
    async fn put_best_effort(&self, key: &str, response: &Response) {
        let entry = CacheEntry::from_response(response);
        let mut storage = self.storage.write().await;
        if let Err(e) = storage.open(&self.config.cache_name).put(key, entry) {
            warn!(url = %key, error = %e, "cache write failed, serving uncached");
        }
    }
}

// ==================== Tests ====================
