//! SQLite-backed cache storage.
//!
//! Named caches keyed by request URL, mirroring the browser's Cache Storage:
//! entries survive restarts, and each cache is bounded by its own
//! [`ExpirationPolicy`]. `stored_at` drives max-age expiry; `access_seq`
//! (bumped on every write and read) drives least-recently-used eviction.

use chrono::{DateTime, Utc};
use coachly_sw_protocol::{FetchResponse, ResponseSource};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SwError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
    /// Delete this cache (with every other registered one) when a write hits
    /// the storage quota, instead of failing the write.
    pub purge_on_quota_error: bool,
}

impl ExpirationPolicy {
    pub fn bounded(max_entries: usize, max_age: Duration) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age: Some(max_age),
            purge_on_quota_error: true,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age: None,
            purge_on_quota_error: false,
        }
    }

    fn is_expired(&self, stored_at_ms: i64, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => {
                let age_ms = now.timestamp_millis().saturating_sub(stored_at_ms);
                age_ms > max_age.as_millis() as i64
            }
            None => false,
        }
    }
}

pub struct CacheStorage {
    path: PathBuf,
    quota_bytes: Option<u64>,
    purgeable: Mutex<BTreeSet<String>>,
}

impl CacheStorage {
    pub fn open(path: PathBuf, quota_bytes: Option<u64>) -> Result<Self> {
        let storage = Self {
            path,
            quota_bytes,
            purgeable: Mutex::new(BTreeSet::new()),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register_purgeable(&self, cache: &str) {
        self.purgeable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(cache.to_string());
    }

    pub fn put(
        &self,
        cache: &str,
        policy: &ExpirationPolicy,
        key: &str,
        response: &FetchResponse,
    ) -> Result<()> {
        self.put_at(cache, policy, key, response, Utc::now())
    }

    pub fn put_at(
        &self,
        cache: &str,
        policy: &ExpirationPolicy,
        key: &str,
        response: &FetchResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if policy.purge_on_quota_error {
            self.register_purgeable(cache);
        }

        let now_ms = now.timestamp_millis();
        match self.write_entry(cache, key, response, now_ms) {
            Err(SwError::QuotaExceeded { required, quota }) if policy.purge_on_quota_error => {
                warn!(
                    cache,
                    required, quota, "Storage quota exceeded; purging registered caches"
                );
                self.purge_registered()?;
                self.write_entry(cache, key, response, now_ms)?;
            }
            result => result?,
        }

        self.expire_at(cache, policy, now)?;
        Ok(())
    }

    pub fn match_entry(
        &self,
        cache: &str,
        policy: &ExpirationPolicy,
        key: &str,
    ) -> Result<Option<FetchResponse>> {
        self.match_entry_at(cache, policy, key, Utc::now())
    }

    /// Looks up an entry. Expired entries are deleted and reported as misses;
    /// hits become the most recently used entry of their cache.
    pub fn match_entry_at(
        &self,
        cache: &str,
        policy: &ExpirationPolicy,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FetchResponse>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT status, headers, body, stored_at FROM cache_entries \
                     WHERE cache_name = ?1 AND cache_key = ?2",
                    params![cache, key],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|err| SwError::storage("Failed to query cache entry", err))?;

            let (status, headers, body, stored_at) = match row {
                Some(row) => row,
                None => return Ok(None),
            };

            if policy.is_expired(stored_at, now) {
                debug!(cache, key, "Dropping expired cache entry");
                conn.execute(
                    "DELETE FROM cache_entries WHERE cache_name = ?1 AND cache_key = ?2",
                    params![cache, key],
                )
                .map_err(|err| SwError::storage("Failed to delete expired entry", err))?;
                return Ok(None);
            }

            conn.execute(
                "UPDATE cache_entries SET \
                    last_accessed = ?3, \
                    access_seq = (SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cache_entries) \
                 WHERE cache_name = ?1 AND cache_key = ?2",
                params![cache, key, now.timestamp_millis()],
            )
            .map_err(|err| SwError::storage("Failed to touch cache entry", err))?;

            let headers: BTreeMap<String, String> =
                serde_json::from_str(&headers).map_err(|source| SwError::Json {
                    context: format!("Failed to decode cached headers for {}", key),
                    source,
                })?;

            Ok(Some(FetchResponse {
                status: status as u16,
                headers,
                body,
                source: ResponseSource::Cache,
            }))
        })
    }

    pub fn delete(&self, cache: &str, key: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM cache_entries WHERE cache_name = ?1 AND cache_key = ?2",
                    params![cache, key],
                )
                .map_err(|err| SwError::storage("Failed to delete cache entry", err))?;
            Ok(removed > 0)
        })
    }

    pub fn delete_cache(&self, cache: &str) -> Result<bool> {
        self.with_connection(|conn| {
            // Immediate: a deferred read-then-write cannot wait out a concurrent writer.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| SwError::storage("Failed to begin transaction", err))?;
            tx.execute(
                "DELETE FROM cache_entries WHERE cache_name = ?1",
                params![cache],
            )
            .map_err(|err| SwError::storage("Failed to delete cache entries", err))?;
            let removed = tx
                .execute("DELETE FROM caches WHERE name = ?1", params![cache])
                .map_err(|err| SwError::storage("Failed to delete cache", err))?;
            tx.commit()
                .map_err(|err| SwError::storage("Failed to commit cache deletion", err))?;
            Ok(removed > 0)
        })
    }

    pub fn cache_names(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM caches ORDER BY name ASC")
                .map_err(|err| SwError::storage("Failed to prepare cache names query", err))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| SwError::storage("Failed to read cache names", err))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| SwError::storage("Failed to decode cache name", err))
        })
    }

    /// Keys of a cache, least recently used first.
    pub fn keys(&self, cache: &str) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT cache_key FROM cache_entries WHERE cache_name = ?1 \
                     ORDER BY access_seq ASC",
                )
                .map_err(|err| SwError::storage("Failed to prepare cache keys query", err))?;
            let rows = stmt
                .query_map(params![cache], |row| row.get::<_, String>(0))
                .map_err(|err| SwError::storage("Failed to read cache keys", err))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| SwError::storage("Failed to decode cache key", err))
        })
    }

    pub fn entry_count(&self, cache: &str) -> Result<usize> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?1",
                params![cache],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count as usize)
            .map_err(|err| SwError::storage("Failed to count cache entries", err))
        })
    }

    pub fn total_bytes(&self) -> Result<u64> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM cache_entries",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|total| total as u64)
            .map_err(|err| SwError::storage("Failed to sum cache size", err))
        })
    }

    pub fn expire(&self, cache: &str, policy: &ExpirationPolicy) -> Result<usize> {
        self.expire_at(cache, policy, Utc::now())
    }

    /// Drops entries older than `max_age`, then evicts least recently used
    /// entries until the cache holds at most `max_entries`.
    pub fn expire_at(
        &self,
        cache: &str,
        policy: &ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_connection(|conn| {
            let mut removed = 0;

            if let Some(max_age) = policy.max_age {
                let cutoff = now.timestamp_millis() - max_age.as_millis() as i64;
                removed += conn
                    .execute(
                        "DELETE FROM cache_entries WHERE cache_name = ?1 AND stored_at < ?2",
                        params![cache, cutoff],
                    )
                    .map_err(|err| SwError::storage("Failed to expire aged entries", err))?;
            }

            if let Some(max_entries) = policy.max_entries {
                removed += conn
                    .execute(
                        "DELETE FROM cache_entries WHERE cache_name = ?1 AND cache_key IN ( \
                            SELECT cache_key FROM cache_entries WHERE cache_name = ?1 \
                            ORDER BY access_seq DESC LIMIT -1 OFFSET ?2 \
                         )",
                        params![cache, max_entries as i64],
                    )
                    .map_err(|err| SwError::storage("Failed to evict cache entries", err))?;
            }

            if removed > 0 {
                debug!(cache, removed, "Expired cache entries");
            }
            Ok(removed)
        })
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| SwError::storage("Failed to read meta value", err))
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|err| SwError::storage("Failed to write meta value", err))?;
            Ok(())
        })
    }

    fn write_entry(
        &self,
        cache: &str,
        key: &str,
        response: &FetchResponse,
        now_ms: i64,
    ) -> Result<()> {
        let headers = serde_json::to_string(&response.headers).map_err(|source| SwError::Json {
            context: format!("Failed to encode headers for {}", key),
            source,
        })?;
        let size = (response.body.len() + headers.len()) as u64;

        self.with_connection(|conn| {
            // Immediate: a deferred read-then-write cannot wait out a concurrent writer.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| SwError::storage("Failed to begin transaction", err))?;

            if let Some(quota) = self.quota_bytes {
                let current: i64 = tx
                    .query_row(
                        "SELECT COALESCE(SUM(size), 0) FROM cache_entries \
                         WHERE NOT (cache_name = ?1 AND cache_key = ?2)",
                        params![cache, key],
                        |row| row.get(0),
                    )
                    .map_err(|err| SwError::storage("Failed to measure cache usage", err))?;
                let required = current as u64 + size;
                if required > quota {
                    return Err(SwError::QuotaExceeded { required, quota });
                }
            }

            tx.execute(
                "INSERT INTO caches (name, created_at) VALUES (?1, ?2) \
                 ON CONFLICT(name) DO NOTHING",
                params![cache, now_ms],
            )
            .map_err(|err| SwError::storage("Failed to register cache", err))?;

            tx.execute(
                "INSERT INTO cache_entries \
                    (cache_name, cache_key, status, headers, body, size, stored_at, last_accessed, access_seq) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, \
                    (SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cache_entries)) \
                 ON CONFLICT(cache_name, cache_key) DO UPDATE SET \
                    status = excluded.status, \
                    headers = excluded.headers, \
                    body = excluded.body, \
                    size = excluded.size, \
                    stored_at = excluded.stored_at, \
                    last_accessed = excluded.last_accessed, \
                    access_seq = excluded.access_seq",
                params![
                    cache,
                    key,
                    response.status as i64,
                    headers,
                    response.body,
                    size as i64,
                    now_ms
                ],
            )
            .map_err(|err| SwError::storage("Failed to write cache entry", err))?;

            tx.commit()
                .map_err(|err| SwError::storage("Failed to commit cache entry", err))?;
            Ok(())
        })
    }

    fn purge_registered(&self) -> Result<usize> {
        let names: Vec<String> = self
            .purgeable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();

        let mut purged = 0;
        for name in names {
            if self.delete_cache(&name)? {
                purged += 1;
            }
        }
        warn!(purged, "Purged caches after quota error");
        Ok(purged)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS caches (
                    name TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS cache_entries (
                    cache_name TEXT NOT NULL,
                    cache_key TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    headers TEXT NOT NULL,
                    body BLOB NOT NULL,
                    size INTEGER NOT NULL,
                    stored_at INTEGER NOT NULL,
                    last_accessed INTEGER NOT NULL,
                    access_seq INTEGER NOT NULL,
                    PRIMARY KEY (cache_name, cache_key)
                 );
                 CREATE INDEX IF NOT EXISTS cache_entries_lru
                    ON cache_entries (cache_name, access_seq);
                 CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| SwError::storage("Failed to initialize cache schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open_connection()?;
        op(&mut conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| SwError::Io {
                context: "Failed to create cache storage dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| SwError::storage("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| SwError::storage("Failed to set busy_timeout", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| SwError::storage("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| SwError::storage("Failed to set synchronous", err))?;

        Ok(conn)
    }
}
