#![allow(dead_code)]

use coachly_sw_protocol::{FetchRequest, FetchResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use sw_core::{CacheStorage, FetchError, Fetcher, ServiceWorker, SwConfig};
use tempfile::TempDir;

pub const ORIGIN: &str = "https://app.coachly.io";

/// Fetcher with a scripted backend: per-URL responses, a connectivity
/// switch, an artificial latency, and a log of every request it saw.
#[derive(Default)]
pub struct ScriptedFetcher {
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    routes: Mutex<HashMap<String, (u16, String)>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|seen| *seen == url).count()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.seen.lock().unwrap().push(request.url.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("connection refused".to_string()));
        }
        let scripted = self.routes.lock().unwrap().get(&request.url).cloned();
        let (status, body) = scripted.unwrap_or_else(|| (200, format!("body:{}", request.url)));
        Ok(FetchResponse::new(status, body))
    }

    fn probe(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<ScriptedFetcher>,
    pub worker: ServiceWorker,
}

/// An installed, activated worker backed by a temp database with the
/// default storage quota.
pub fn activated_worker() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let backend = Arc::new(ScriptedFetcher::default());
    let config = SwConfig::default();
    assert!(config.storage.quota_bytes.is_some());
    let storage = Arc::new(
        CacheStorage::open(dir.path().join("cache.db"), config.storage.quota_bytes)
            .expect("open storage"),
    );
    let fetcher: Arc<dyn Fetcher> = backend.clone();
    let worker = ServiceWorker::new(&config, storage, fetcher).expect("worker");
    worker.install().expect("install");
    assert!(worker.is_active());
    Harness {
        dir,
        backend,
        worker,
    }
}

pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}
