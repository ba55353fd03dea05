//! Install-time precache of the app shell and other revisioned assets.
//!
//! Entries are stored under `url?__rev=<revision>` so that a new revision
//! lands beside the old one until activation removes the outdated key.

use coachly_sw_protocol::{FetchRequest, FetchResponse, ResponseSource};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStorage, ExpirationPolicy};
use crate::error::{Result, SwError};
use crate::fetcher::Fetcher;

pub const PRECACHE_NAME: &str = "precache";
const REVISION_PARAM: &str = "__rev";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrecacheEntry {
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Clone)]
struct ResolvedEntry {
    url: String,
    key: String,
}

#[derive(Debug, Clone)]
pub struct Precache {
    origin: Url,
    entries: Vec<ResolvedEntry>,
}

impl Precache {
    pub fn new(origin: &str, entries: &[PrecacheEntry]) -> Result<Self> {
        let origin = Url::parse(origin).map_err(|err| SwError::InvalidUrl {
            url: origin.to_string(),
            reason: err.to_string(),
        })?;

        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let url = resolve(&origin, &entry.url)?;
            let key = match &entry.revision {
                Some(revision) => {
                    let mut keyed = url.clone();
                    keyed
                        .query_pairs_mut()
                        .append_pair(REVISION_PARAM, revision);
                    keyed.to_string()
                }
                None => url.to_string(),
            };
            resolved.push(ResolvedEntry {
                url: url.to_string(),
                key,
            });
        }

        Ok(Self {
            origin,
            entries: resolved,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute form of a (possibly origin-relative) URL.
    pub fn resolve_url(&self, url: &str) -> Result<String> {
        resolve(&self.origin, url).map(|url| url.to_string())
    }

    /// Fetches every entry and stores it. Any failure aborts the install.
    pub fn install(&self, storage: &CacheStorage, fetcher: &dyn Fetcher) -> Result<usize> {
        let policy = ExpirationPolicy::unbounded();
        for entry in &self.entries {
            let response = fetcher
                .fetch(&FetchRequest::get(entry.url.clone()))
                .map_err(|err| SwError::PrecacheFailed {
                    url: entry.url.clone(),
                    reason: err.to_string(),
                })?;
            if !response.is_success() {
                return Err(SwError::PrecacheFailed {
                    url: entry.url.clone(),
                    reason: format!("unexpected status {}", response.status),
                });
            }
            storage.put(PRECACHE_NAME, &policy, &entry.key, &response)?;
            debug!(url = %entry.url, key = %entry.key, "Precached");
        }
        info!(entries = self.entries.len(), "Precache installed");
        Ok(self.entries.len())
    }

    pub fn lookup(&self, storage: &CacheStorage, url: &str) -> Result<Option<FetchResponse>> {
        let absolute = self.resolve_url(url)?;
        let entry = match self.entries.iter().find(|entry| entry.url == absolute) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let hit = storage.match_entry(PRECACHE_NAME, &ExpirationPolicy::unbounded(), &entry.key)?;
        Ok(hit.map(|response| response.with_source(ResponseSource::Precache)))
    }

    /// Deletes precache keys that no longer belong to the manifest.
    pub fn cleanup_outdated(&self, storage: &CacheStorage) -> Result<usize> {
        let expected: HashSet<&str> = self.entries.iter().map(|entry| entry.key.as_str()).collect();
        let mut removed = 0;
        for key in storage.keys(PRECACHE_NAME)? {
            if !expected.contains(key.as_str()) && storage.delete(PRECACHE_NAME, &key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Removed outdated precache entries");
        }
        Ok(removed)
    }
}

fn resolve(origin: &Url, url: &str) -> Result<Url> {
    origin.join(url).map_err(|err| SwError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::StubFetcher;
    use tempfile::TempDir;

    fn entries(revision: &str) -> Vec<PrecacheEntry> {
        vec![
            PrecacheEntry {
                url: "/index.html".to_string(),
                revision: Some(revision.to_string()),
            },
            PrecacheEntry {
                url: "/manifest.json".to_string(),
                revision: None,
            },
        ]
    }

    fn storage() -> (TempDir, CacheStorage) {
        let dir = TempDir::new().expect("temp dir");
        let storage = CacheStorage::open(dir.path().join("cache.db"), None).expect("storage");
        (dir, storage)
    }

    #[test]
    fn install_stores_revisioned_keys() {
        let (_dir, storage) = storage();
        let precache = Precache::new("https://app.coachly.io", &entries("v1")).expect("precache");
        let fetcher = StubFetcher::online();

        assert_eq!(precache.install(&storage, &fetcher).expect("install"), 2);
        let keys = storage.keys(PRECACHE_NAME).expect("keys");
        assert!(keys.contains(&"https://app.coachly.io/index.html?__rev=v1".to_string()));
        assert!(keys.contains(&"https://app.coachly.io/manifest.json".to_string()));
    }

    #[test]
    fn lookup_resolves_relative_urls() {
        let (_dir, storage) = storage();
        let precache = Precache::new("https://app.coachly.io", &entries("v1")).expect("precache");
        precache.install(&storage, &StubFetcher::online()).expect("install");

        let shell = precache
            .lookup(&storage, "/index.html")
            .expect("lookup")
            .expect("hit");
        assert_eq!(shell.source, ResponseSource::Precache);
        assert_eq!(shell.body_text(), "fresh:https://app.coachly.io/index.html");
    }

    #[test]
    fn install_fails_when_offline() {
        let (_dir, storage) = storage();
        let precache = Precache::new("https://app.coachly.io", &entries("v1")).expect("precache");
        let err = precache.install(&storage, &StubFetcher::offline()).unwrap_err();
        assert!(matches!(err, SwError::PrecacheFailed { .. }));
    }

    #[test]
    fn install_rejects_error_status() {
        let (_dir, storage) = storage();
        let precache = Precache::new("https://app.coachly.io", &entries("v1")).expect("precache");
        let fetcher = StubFetcher::online();
        fetcher.respond("https://app.coachly.io/manifest.json", 500, "boom");
        assert!(precache.install(&storage, &fetcher).is_err());
    }

    #[test]
    fn cleanup_removes_previous_revisions() {
        let (_dir, storage) = storage();
        let fetcher = StubFetcher::online();
        Precache::new("https://app.coachly.io", &entries("v1"))
            .expect("v1")
            .install(&storage, &fetcher)
            .expect("install v1");
        let v2 = Precache::new("https://app.coachly.io", &entries("v2")).expect("v2");
        v2.install(&storage, &fetcher).expect("install v2");

        assert_eq!(v2.cleanup_outdated(&storage).expect("cleanup"), 1);
        let keys = storage.keys(PRECACHE_NAME).expect("keys");
        assert_eq!(keys.len(), 2);
        assert!(!keys.iter().any(|key| key.ends_with("__rev=v1")));
    }
}
