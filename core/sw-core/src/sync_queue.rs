//! Offline mutation queue.
//!
//! Holds mutating requests that failed to reach the network until a
//! background sync replays them. The queue lives in memory only and is
//! owned by one worker instance: entries die with the process, the same
//! best-effort guarantee the browser worker gave.

use chrono::{DateTime, Utc};
use coachly_sw_protocol::{FetchRequest, FetchResponse, QueueEntrySummary};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::fetcher::{FetchError, Fetcher};

pub const TAG_PREFIX: &str = "sync-";

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub tag: String,
    pub request: FetchRequest,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    in_flight: bool,
}

impl QueuedRequest {
    pub fn summary(&self) -> QueueEntrySummary {
        QueueEntrySummary {
            tag: self.tag.clone(),
            method: self.request.method,
            url: self.request.url.clone(),
            queued_at: self.queued_at,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ReplayOutcome {
    Succeeded(FetchResponse),
    Failed(FetchError),
    /// No entry for the tag: already replayed, or never queued.
    Missing,
    /// Another sync for the same tag is still running.
    InFlight,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<String, QueuedRequest>,
    last_tag_millis: i64,
}

#[derive(Default)]
pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: FetchRequest) -> String {
        self.enqueue_at(request, Utc::now())
    }

    /// Stores a snapshot of `request` and returns its tag.
    pub fn enqueue_at(&self, request: FetchRequest, now: DateTime<Utc>) -> String {
        let mut inner = self.lock();
        // Tags are epoch millis; bump past the last one so failures in the
        // same millisecond still get distinct tags.
        let millis = now.timestamp_millis().max(inner.last_tag_millis + 1);
        inner.last_tag_millis = millis;
        let tag = format!("{}{}", TAG_PREFIX, millis);

        inner.entries.insert(
            tag.clone(),
            QueuedRequest {
                tag: tag.clone(),
                request,
                queued_at: now,
                attempts: 0,
                last_error: None,
                in_flight: false,
            },
        );
        tag
    }

    pub fn get(&self, tag: &str) -> Option<QueuedRequest> {
        self.lock().entries.get(tag).cloned()
    }

    /// Tags in registration order.
    pub fn tags(&self) -> Vec<String> {
        let inner = self.lock();
        let mut entries: Vec<&QueuedRequest> = inner.entries.values().collect();
        entries.sort_by_key(|entry| tag_millis(&entry.tag));
        entries.into_iter().map(|entry| entry.tag.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<QueueEntrySummary> {
        let inner = self.lock();
        let mut summaries: Vec<QueueEntrySummary> =
            inner.entries.values().map(QueuedRequest::summary).collect();
        summaries.sort_by_key(|summary| tag_millis(&summary.tag));
        summaries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn remove(&self, tag: &str) -> Option<QueuedRequest> {
        self.lock().entries.remove(tag)
    }

    /// Replays the request stored under `tag`.
    ///
    /// Success removes the entry. Failure keeps it for the next sync and
    /// records the attempt. The lock is not held across the network call.
    pub fn replay(&self, tag: &str, fetcher: &dyn Fetcher) -> ReplayOutcome {
        let request = {
            let mut inner = self.lock();
            match inner.entries.get_mut(tag) {
                Some(entry) if entry.in_flight => return ReplayOutcome::InFlight,
                Some(entry) => {
                    entry.in_flight = true;
                    entry.attempts += 1;
                    entry.request.clone()
                }
                None => return ReplayOutcome::Missing,
            }
        };

        let result = fetcher.fetch(&request);

        let mut inner = self.lock();
        match result {
            Ok(response) => {
                inner.entries.remove(tag);
                ReplayOutcome::Succeeded(response)
            }
            // Delivered once already; another replay would duplicate it.
            Err(err) if err.reached_backend() => {
                inner.entries.remove(tag);
                ReplayOutcome::Failed(err)
            }
            Err(err) => {
                if let Some(entry) = inner.entries.get_mut(tag) {
                    entry.in_flight = false;
                    entry.last_error = Some(err.to_string());
                }
                ReplayOutcome::Failed(err)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn tag_millis(tag: &str) -> i64 {
    tag.strip_prefix(TAG_PREFIX)
        .and_then(|millis| millis.parse().ok())
        .unwrap_or(i64::MAX)
}
