//! Caching strategies.
//!
//! Each strategy decides how a read request is answered from the network,
//! from a named cache, or both. Storage failures never fail a request: a
//! broken cache read is a miss and a broken write is logged and dropped.

use coachly_sw_protocol::{FetchRequest, FetchResponse};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, ExpirationPolicy};
use crate::error::Result;
use crate::fetcher::{FetchError, Fetcher};
use crate::precache::Precache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst { timeout: Duration },
    StaleWhileRevalidate,
    NetworkOnly,
    /// Answer navigations with the precached app shell.
    PrecacheShell { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub name: String,
    pub policy: ExpirationPolicy,
}

impl CacheTarget {
    pub fn new(name: &str, policy: ExpirationPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
        }
    }
}

pub struct StrategyContext<'a> {
    pub storage: &'a Arc<CacheStorage>,
    pub fetcher: &'a Arc<dyn Fetcher>,
    pub precache: &'a Precache,
}

/// A strategy's answer. `revalidation` is set when a background refresh was
/// started; callers may join it or let it run detached.
pub struct Handled {
    pub response: FetchResponse,
    pub revalidation: Option<JoinHandle<()>>,
}

impl Handled {
    fn now(response: FetchResponse) -> Self {
        Self {
            response,
            revalidation: None,
        }
    }
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst { .. } => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::NetworkOnly => "network-only",
            Strategy::PrecacheShell { .. } => "precache-shell",
        }
    }

    pub fn handle(
        &self,
        request: &FetchRequest,
        target: Option<&CacheTarget>,
        ctx: &StrategyContext<'_>,
    ) -> Result<Handled> {
        match (self, target) {
            (Strategy::PrecacheShell { url }, _) => precache_shell(url, request, ctx),
            (Strategy::NetworkOnly, _) | (_, None) => network_only(request, ctx),
            (Strategy::CacheFirst, Some(target)) => cache_first(request, target, ctx),
            (Strategy::NetworkFirst { timeout }, Some(target)) => {
                network_first(request, target, *timeout, ctx)
            }
            (Strategy::StaleWhileRevalidate, Some(target)) => {
                stale_while_revalidate(request, target, ctx)
            }
        }
    }
}

/// Cache key for a request: its URL without the fragment.
pub fn cache_key(request: &FetchRequest) -> String {
    match request.parsed_url() {
        Some(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        None => request.url.clone(),
    }
}

fn network_only(request: &FetchRequest, ctx: &StrategyContext<'_>) -> Result<Handled> {
    let response = ctx.fetcher.fetch(request)?;
    Ok(Handled::now(response))
}

fn cache_first(
    request: &FetchRequest,
    target: &CacheTarget,
    ctx: &StrategyContext<'_>,
) -> Result<Handled> {
    if let Some(hit) = lookup(ctx.storage, target, request) {
        return Ok(Handled::now(hit));
    }
    let response = ctx.fetcher.fetch(request)?;
    store(ctx.storage, target, request, &response);
    Ok(Handled::now(response))
}

fn network_first(
    request: &FetchRequest,
    target: &CacheTarget,
    timeout: Duration,
    ctx: &StrategyContext<'_>,
) -> Result<Handled> {
    let (tx, rx) = mpsc::channel();
    let fetcher = Arc::clone(ctx.fetcher);
    let storage = Arc::clone(ctx.storage);
    let owned_target = target.clone();
    let owned_request = request.clone();

    // The network task stores its own result, so a response that loses the
    // race still refreshes the cache.
    thread::spawn(move || {
        let result = fetcher.fetch(&owned_request);
        if let Ok(response) = &result {
            store(&storage, &owned_target, &owned_request, response);
        }
        let _ = tx.send(result);
    });

    let settle = |result: std::result::Result<FetchResponse, FetchError>| -> Result<Handled> {
        match result {
            Ok(response) => Ok(Handled::now(response)),
            Err(err) if err.is_network_failure() => match lookup(ctx.storage, target, request) {
                Some(hit) => {
                    debug!(cache = %target.name, error = %err, "Network failed; serving cache");
                    Ok(Handled::now(hit))
                }
                None => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => settle(result),
        Err(RecvTimeoutError::Timeout) => {
            if let Some(hit) = lookup(ctx.storage, target, request) {
                debug!(
                    cache = %target.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Network timed out; serving cache"
                );
                return Ok(Handled::now(hit));
            }
            match rx.recv() {
                Ok(result) => settle(result),
                Err(_) => Err(FetchError::Network("network task ended without a result".into()).into()),
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(FetchError::Network("network task ended without a result".into()).into())
        }
    }
}

fn stale_while_revalidate(
    request: &FetchRequest,
    target: &CacheTarget,
    ctx: &StrategyContext<'_>,
) -> Result<Handled> {
    match lookup(ctx.storage, target, request) {
        Some(hit) => {
            let fetcher = Arc::clone(ctx.fetcher);
            let storage = Arc::clone(ctx.storage);
            let owned_target = target.clone();
            let owned_request = request.clone();
            let revalidation = thread::spawn(move || match fetcher.fetch(&owned_request) {
                Ok(response) => store(&storage, &owned_target, &owned_request, &response),
                Err(err) => {
                    debug!(cache = %owned_target.name, error = %err, "Background revalidation failed");
                }
            });
            Ok(Handled {
                response: hit,
                revalidation: Some(revalidation),
            })
        }
        None => {
            let response = ctx.fetcher.fetch(request)?;
            store(ctx.storage, target, request, &response);
            Ok(Handled::now(response))
        }
    }
}

fn precache_shell(url: &str, request: &FetchRequest, ctx: &StrategyContext<'_>) -> Result<Handled> {
    match ctx.precache.lookup(ctx.storage, url) {
        Ok(Some(shell)) => Ok(Handled::now(shell)),
        Ok(None) => {
            debug!(url, "App shell not precached; using network");
            network_only(request, ctx)
        }
        Err(err) => {
            warn!(url, error = %err, "Failed to read precached shell");
            network_only(request, ctx)
        }
    }
}

fn lookup(storage: &CacheStorage, target: &CacheTarget, request: &FetchRequest) -> Option<FetchResponse> {
    match storage.match_entry(&target.name, &target.policy, &cache_key(request)) {
        Ok(hit) => hit,
        Err(err) => {
            warn!(cache = %target.name, error = %err, "Cache read failed; treating as miss");
            None
        }
    }
}

fn store(storage: &CacheStorage, target: &CacheTarget, request: &FetchRequest, response: &FetchResponse) {
    if response.status != 200 {
        return;
    }
    if let Err(err) = storage.put(&target.name, &target.policy, &cache_key(request), response) {
        warn!(cache = %target.name, url = %request.url, error = %err, "Cache write failed");
    }
}
