//! The network seam.
//!
//! Everything that leaves the worker goes through a [`Fetcher`]. The daemon
//! plugs in an HTTP client; tests plug in scripted fakes.

use std::time::Duration;

use coachly_sw_protocol::{FetchRequest, FetchResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, reset. The request may not have
    /// reached the backend.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Network timed out after {0:?}")]
    Timeout(Duration),

    /// The backend sent a status line, then the body was cut off. The
    /// request reached the backend, so replaying it would duplicate it.
    #[error("Response interrupted: {0}")]
    Interrupted(String),

    /// The request could not be built at all. Never queued for retry.
    #[error("Request rejected before sending: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// True for failures caused by connectivity rather than by the request.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Interrupted(_)
        )
    }

    /// True when the backend is known to have received the request.
    pub fn reached_backend(&self) -> bool {
        matches!(self, FetchError::Interrupted(_))
    }
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;

    /// Cheap reachability check used to decide when queued mutations may be
    /// replayed.
    fn probe(&self) -> bool;
}
