//! # sw-core
//!
//! Engine for the Coachly offline edge worker: the request-handling layer
//! that sits between the web app and its backend, answering reads from named
//! caches and parking failed writes until connectivity returns.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Strategies that race the network use
//!   plain threads and channels.
//! - **Injected network**: All upstream traffic goes through [`Fetcher`], so
//!   the engine is testable without sockets.
//! - **Caches are durable, the queue is not**: cache storage lives in SQLite;
//!   queued mutations live in memory and are lost on restart.
//! - **Storage never fails a read**: a broken cache read is a miss.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sw_core::{load_config, CacheStorage, ServiceWorker};
//!
//! let config = load_config(None)?;
//! let storage = Arc::new(CacheStorage::open(config.db_path()?, config.storage.quota_bytes)?);
//! let worker = ServiceWorker::new(&config, storage, fetcher)?;
//! worker.install()?;
//! let response = worker.handle_fetch(request)?;
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod patterns;
pub mod precache;
pub mod redirect;
pub mod routes;
pub mod strategy;
pub mod sync_queue;
pub mod worker;

pub use cache::{CacheStorage, ExpirationPolicy};
pub use clients::ClientRegistry;
pub use config::*;
pub use error::{Result, SwError};
pub use fetcher::{FetchError, Fetcher};
pub use lifecycle::WorkerState;
pub use precache::{Precache, PrecacheEntry, PRECACHE_NAME};
pub use redirect::{parse_location, subdomain_redirect, www_redirect, RedirectGuard, Viewer, ViewerRole};
pub use routes::{RouteMatcher, RouteRule, RouteTable};
pub use strategy::{cache_key, CacheTarget, Handled, Strategy};
pub use sync_queue::{OfflineQueue, ReplayOutcome};
pub use worker::{ServiceWorker, WorkerSnapshot, QUEUED_MESSAGE};
