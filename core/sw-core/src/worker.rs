//! ServiceWorker - the request-handling engine.
//!
//! Owns everything a worker instance needs: the route table, cache storage,
//! the offline mutation queue, connected clients and lifecycle state. The
//! network is injected as an `Arc<dyn Fetcher>`, so the engine itself does no
//! I/O beyond SQLite.
//!
//! ## Request flow
//!
//! ```text
//! handle_fetch
//!   ├─ not activated ──────────────► network (uncontrolled)
//!   ├─ POST/PUT/PATCH/DELETE ──────► network ──(network error)──► queue, 202
//!   └─ read ──► route table ──► strategy ──► cache / network
//! ```

use coachly_sw_protocol::{
    CacheSummary, ClientMessage, FetchRequest, FetchResponse, QueueEntrySummary, QueuedBody,
    ResponseSource, SyncReport, SyncStatus,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cache::CacheStorage;
use crate::clients::ClientRegistry;
use crate::config::SwConfig;
use crate::error::{Result, SwError};
use crate::fetcher::Fetcher;
use crate::lifecycle::{should_activate_immediately, Lifecycle, WorkerState, ACTIVE_VERSION_KEY};
use crate::precache::{Precache, PRECACHE_NAME};
use crate::routes::RouteTable;
use crate::strategy::{Handled, StrategyContext};
use crate::sync_queue::{OfflineQueue, ReplayOutcome};

pub const QUEUED_MESSAGE: &str = "Request queued for background sync";

/// Health data reported over IPC.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub version: String,
    pub queue_len: usize,
    pub clients: usize,
    pub caches: Vec<CacheSummary>,
}

pub struct ServiceWorker {
    version: String,
    routes: RouteTable,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    precache: Precache,
    queue: OfflineQueue,
    clients: ClientRegistry,
    lifecycle: Mutex<Lifecycle>,
}

impl ServiceWorker {
    pub fn new(config: &SwConfig, storage: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let precache = Precache::new(&config.worker.origin, &config.precache)?;
        let shell_url = precache.resolve_url(&config.worker.shell_path)?;
        let routes = RouteTable::default_table(
            Duration::from_secs(config.network.network_timeout_secs),
            &shell_url,
        );
        Ok(Self::with_routes(
            config.worker.version.clone(),
            routes,
            precache,
            storage,
            fetcher,
        ))
    }

    /// Builds a worker around a custom route table.
    pub fn with_routes(
        version: String,
        routes: RouteTable,
        precache: Precache,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        for target in routes.cache_targets() {
            if target.policy.purge_on_quota_error {
                storage.register_purgeable(&target.name);
            }
        }

        Self {
            version,
            routes,
            storage,
            fetcher,
            precache,
            queue: OfflineQueue::new(),
            clients: ClientRegistry::new(),
            lifecycle: Mutex::new(Lifecycle::new()),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle().state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle().is_active()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Precaches the manifest, then activates if no other version is in
    /// control. Returns the resulting state.
    pub fn install(&self) -> Result<WorkerState> {
        if !self.lifecycle().begin_install() {
            return Ok(self.state());
        }

        info!(version = %self.version, entries = self.precache.len(), "Installing worker");
        if let Err(err) = self.precache.install(&self.storage, self.fetcher.as_ref()) {
            self.lifecycle().finish_install(false);
            warn!(version = %self.version, error = %err, "Install failed; worker is redundant");
            return Err(err);
        }
        self.lifecycle().finish_install(true);

        let active_version = self.storage.get_meta(ACTIVE_VERSION_KEY)?;
        if should_activate_immediately(active_version.as_deref(), &self.version) {
            self.activate()?;
        } else {
            info!(
                version = %self.version,
                active_version = active_version.as_deref().unwrap_or_default(),
                "Worker installed; waiting for SKIP_WAITING"
            );
        }
        Ok(self.state())
    }

    /// Takes control. Returns false if the worker was not waiting.
    pub fn activate(&self) -> Result<bool> {
        if !self.lifecycle().begin_activate() {
            return Ok(false);
        }

        match self.clean_up_caches() {
            Ok(()) => {
                self.lifecycle().finish_activate(true);
                info!(version = %self.version, "Worker activated");
                Ok(true)
            }
            Err(err) => {
                self.lifecycle().finish_activate(false);
                warn!(version = %self.version, error = %err, "Activation failed");
                Err(err)
            }
        }
    }

    fn clean_up_caches(&self) -> Result<()> {
        let mut owned: HashSet<String> = self.routes.cache_names().into_iter().collect();
        owned.insert(PRECACHE_NAME.to_string());

        for name in self.storage.cache_names()? {
            if !owned.contains(&name) && self.storage.delete_cache(&name)? {
                info!(cache = %name, "Deleted cache not owned by this version");
            }
        }
        self.precache.cleanup_outdated(&self.storage)?;
        self.storage.set_meta(ACTIVE_VERSION_KEY, &self.version)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fetch
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.dispatch(request).map(|handled| handled.response)
    }

    /// Like [`handle_fetch`](Self::handle_fetch) but hands back any
    /// background revalidation so callers can wait for it.
    pub fn dispatch(&self, request: FetchRequest) -> Result<Handled> {
        request.validate()?;

        if !self.is_active() {
            debug!(url = %request.url, state = %self.state(), "Worker not in control; passing through");
            return Ok(handled(self.fetcher.fetch(&request)?));
        }

        if request.method.is_mutating() {
            return self.handle_mutation(request).map(handled);
        }

        let rule = match self.routes.match_request(&request) {
            Some(rule) => rule,
            None => {
                debug!(url = %request.url, "No route matched; using network");
                return Ok(handled(self.fetcher.fetch(&request)?));
            }
        };

        let ctx = StrategyContext {
            storage: &self.storage,
            fetcher: &self.fetcher,
            precache: &self.precache,
        };
        let result = rule.strategy.handle(&request, rule.cache.as_ref(), &ctx)?;
        debug!(
            url = %request.url,
            rule = %rule.name,
            strategy = rule.strategy.name(),
            status = result.response.status,
            source = ?result.response.source,
            "Fetch handled"
        );
        Ok(result)
    }

    fn handle_mutation(&self, request: FetchRequest) -> Result<FetchResponse> {
        match self.fetcher.fetch(&request) {
            Ok(response) => Ok(response),
            Err(err) if err.is_network_failure() && !err.reached_backend() => {
                let method = request.method;
                let url = request.url.clone();
                let tag = self.queue.enqueue(request);
                info!(%tag, method = method.as_str(), %url, error = %err, "Mutation queued for background sync");

                let body = QueuedBody {
                    queued: true,
                    message: QUEUED_MESSAGE.to_string(),
                    tag,
                };
                let value = serde_json::to_value(&body).map_err(|source| SwError::Json {
                    context: "Failed to encode queued response".to_string(),
                    source,
                })?;
                Ok(FetchResponse::json(202, &value).with_source(ResponseSource::Queued))
            }
            Err(err) => Err(err.into()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background sync
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_sync(&self, tag: &str) -> SyncReport {
        match self.queue.replay(tag, self.fetcher.as_ref()) {
            ReplayOutcome::Succeeded(response) => {
                let delivered = self.clients.broadcast(&ClientMessage::SyncSuccess {
                    tag: tag.to_string(),
                });
                info!(%tag, status = response.status, delivered, "Queued request replayed");
                report(tag, SyncStatus::Succeeded, None)
            }
            ReplayOutcome::Failed(err) => {
                let error = err.to_string();
                let delivered = self.clients.broadcast(&ClientMessage::SyncFailed {
                    tag: tag.to_string(),
                    error: error.clone(),
                });
                let requeued = !err.reached_backend();
                warn!(%tag, %error, delivered, requeued, "Replay failed");
                report(tag, SyncStatus::Failed, Some(error))
            }
            ReplayOutcome::Missing => {
                debug!(%tag, "Sync for unknown tag ignored");
                report(tag, SyncStatus::Missing, None)
            }
            ReplayOutcome::InFlight => {
                debug!(%tag, "Sync already running for tag");
                report(tag, SyncStatus::InFlight, None)
            }
        }
    }

    /// Replays every queued request in registration order.
    pub fn sync_all(&self) -> Vec<SyncReport> {
        self.queue
            .tags()
            .iter()
            .map(|tag| self.handle_sync(tag))
            .collect()
    }

    pub fn has_pending_sync(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn probe_network(&self) -> bool {
        self.fetcher.probe()
    }

    pub fn queue_summaries(&self) -> Vec<QueueEntrySummary> {
        self.queue.summaries()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Clients
    // ─────────────────────────────────────────────────────────────────────

    /// Returns true if the message changed worker state.
    pub fn handle_message(&self, message: ClientMessage) -> Result<bool> {
        match message {
            ClientMessage::SkipWaiting => {
                let activated = self.activate()?;
                if !activated {
                    debug!(state = %self.state(), "SKIP_WAITING ignored; worker not waiting");
                }
                Ok(activated)
            }
            other => {
                debug!(message = ?other, "Ignoring worker-bound message");
                Ok(false)
            }
        }
    }

    pub fn subscribe(&self) -> (Ulid, Receiver<ClientMessage>) {
        self.clients.register()
    }

    pub fn unsubscribe(&self, id: &Ulid) -> bool {
        self.clients.unregister(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn cache_summaries(&self) -> Result<Vec<CacheSummary>> {
        let mut summaries = Vec::new();
        summaries.push(CacheSummary {
            name: PRECACHE_NAME.to_string(),
            entries: self.storage.entry_count(PRECACHE_NAME)?,
            max_entries: None,
            max_age_secs: None,
        });
        for target in self.routes.cache_targets() {
            summaries.push(CacheSummary {
                name: target.name.clone(),
                entries: self.storage.entry_count(&target.name)?,
                max_entries: target.policy.max_entries,
                max_age_secs: target.policy.max_age.map(|age| age.as_secs()),
            });
        }
        Ok(summaries)
    }

    pub fn snapshot(&self) -> Result<WorkerSnapshot> {
        Ok(WorkerSnapshot {
            state: self.state(),
            version: self.version.clone(),
            queue_len: self.queue.len(),
            clients: self.clients.len(),
            caches: self.cache_summaries()?,
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn handled(response: FetchResponse) -> Handled {
    Handled {
        response,
        revalidation: None,
    }
}

fn report(tag: &str, status: SyncStatus, error: Option<String>) -> SyncReport {
    SyncReport {
        tag: tag.to_string(),
        status,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::StubFetcher;
    use crate::precache::PrecacheEntry;
    use coachly_sw_protocol::HttpMethod;
    use tempfile::TempDir;

    fn config(version: &str) -> SwConfig {
        let mut config = SwConfig::default();
        config.worker.version = version.to_string();
        config.precache = vec![PrecacheEntry {
            url: "/index.html".to_string(),
            revision: Some(version.to_string()),
        }];
        config
    }

    fn worker(dir: &TempDir, version: &str, stub: Arc<StubFetcher>) -> ServiceWorker {
        let storage = Arc::new(CacheStorage::open(dir.path().join("cache.db"), None).expect("storage"));
        let fetcher: Arc<dyn Fetcher> = stub;
        ServiceWorker::new(&config(version), storage, fetcher).expect("worker")
    }

    #[test]
    fn first_install_activates() {
        let dir = TempDir::new().expect("temp dir");
        let worker = worker(&dir, "1", Arc::new(StubFetcher::online()));
        assert_eq!(worker.install().expect("install"), WorkerState::Activated);
        assert_eq!(
            worker.storage().get_meta(ACTIVE_VERSION_KEY).expect("meta").as_deref(),
            Some("1")
        );
    }

    #[test]
    fn new_version_waits_for_skip_waiting() {
        let dir = TempDir::new().expect("temp dir");
        let stub = Arc::new(StubFetcher::online());
        worker(&dir, "1", stub.clone()).install().expect("install v1");

        let next = worker(&dir, "2", stub);
        assert_eq!(next.install().expect("install v2"), WorkerState::Installed);
        assert!(next.handle_message(ClientMessage::SkipWaiting).expect("skip"));
        assert_eq!(next.state(), WorkerState::Activated);
        assert!(!next.handle_message(ClientMessage::SkipWaiting).expect("again"));
    }

    #[test]
    fn failed_install_leaves_worker_redundant_and_passing_through() {
        let dir = TempDir::new().expect("temp dir");
        let stub = Arc::new(StubFetcher::offline());
        let worker = worker(&dir, "1", stub.clone());
        assert!(worker.install().is_err());
        assert_eq!(worker.state(), WorkerState::Redundant);

        stub.set_offline(false);
        let response = worker
            .handle_fetch(FetchRequest::get("https://app.coachly.io/api/courses"))
            .expect("passthrough");
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(worker.storage().entry_count("course-content").expect("count"), 0);
    }

    #[test]
    fn activation_drops_foreign_caches() {
        let dir = TempDir::new().expect("temp dir");
        let worker = worker(&dir, "1", Arc::new(StubFetcher::online()));
        worker
            .storage()
            .put(
                "legacy-cache",
                &crate::cache::ExpirationPolicy::unbounded(),
                "https://app.coachly.io/old",
                &FetchResponse::new(200, "old"),
            )
            .expect("seed");

        worker.install().expect("install");
        let names = worker.storage().cache_names().expect("names");
        assert!(!names.contains(&"legacy-cache".to_string()));
    }

    #[test]
    fn mutation_is_not_queued_before_activation() {
        let dir = TempDir::new().expect("temp dir");
        let worker = worker(&dir, "1", Arc::new(StubFetcher::offline()));
        let request = FetchRequest::new(HttpMethod::Post, "https://app.coachly.io/api/notes")
            .with_body("{}");
        assert!(worker.handle_fetch(request).is_err());
        assert!(!worker.has_pending_sync());
    }

    #[test]
    fn interrupted_mutation_is_not_queued() {
        let dir = TempDir::new().expect("temp dir");
        let stub = Arc::new(StubFetcher::online());
        let worker = worker(&dir, "1", stub.clone());
        worker.install().expect("install");
        stub.set_interrupted(true);

        let request = FetchRequest::new(HttpMethod::Post, "https://app.coachly.io/api/notes")
            .with_body("{}");
        let err = worker.handle_fetch(request).unwrap_err();
        assert_eq!(err.code(), "response_interrupted");
        assert!(!worker.has_pending_sync());
    }

    #[test]
    fn invalid_request_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let worker = worker(&dir, "1", Arc::new(StubFetcher::online()));
        let err = worker
            .handle_fetch(FetchRequest::get("ftp://app.coachly.io/file"))
            .unwrap_err();
        assert!(matches!(err, SwError::InvalidRequest { .. }));
    }

    #[test]
    fn snapshot_lists_every_cache() {
        let dir = TempDir::new().expect("temp dir");
        let worker = worker(&dir, "1", Arc::new(StubFetcher::online()));
        worker.install().expect("install");
        let snapshot = worker.snapshot().expect("snapshot");
        assert_eq!(snapshot.state, WorkerState::Activated);
        assert_eq!(snapshot.caches.len(), 7);
        assert_eq!(snapshot.caches[0].name, PRECACHE_NAME);
        assert_eq!(snapshot.caches[0].entries, 1);
    }
}
