//! Error types for sw-core operations.

use std::path::PathBuf;

use crate::fetcher::FetchError;

/// All errors that can occur inside the worker engine.
#[derive(Debug, thiserror::Error)]
pub enum SwError {
    // ─────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid request: {code}: {message}")]
    InvalidRequest { code: String, message: String },

    #[error("Invalid URL: {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    // ─────────────────────────────────────────────────────────────────────
    // Cache Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cache storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage quota exceeded: {required} bytes required, quota is {quota} bytes")]
    QuotaExceeded { required: u64, quota: u64 },

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailed { url: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration & I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SwError {
    pub(crate) fn storage(context: impl Into<String>, source: rusqlite::Error) -> Self {
        SwError::Storage {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code, used in IPC error responses.
    pub fn code(&self) -> &str {
        match self {
            SwError::InvalidRequest { code, .. } => code,
            SwError::InvalidUrl { .. } => "invalid_url",
            SwError::Fetch(FetchError::Timeout(_)) => "network_timeout",
            SwError::Fetch(FetchError::InvalidRequest(_)) => "invalid_request",
            SwError::Fetch(FetchError::Network(_)) => "network_error",
            SwError::Fetch(FetchError::Interrupted(_)) => "response_interrupted",
            SwError::Storage { .. } => "storage_error",
            SwError::QuotaExceeded { .. } => "quota_exceeded",
            SwError::PrecacheFailed { .. } => "precache_failed",
            SwError::HomeDirNotFound => "home_not_found",
            SwError::ConfigMalformed { .. } => "config_malformed",
            SwError::Io { .. } => "io_error",
            SwError::Json { .. } => "json_error",
        }
    }
}

impl From<coachly_sw_protocol::ErrorInfo> for SwError {
    fn from(info: coachly_sw_protocol::ErrorInfo) -> Self {
        SwError::InvalidRequest {
            code: info.code,
            message: info.message,
        }
    }
}

/// Convenience type alias for Results using SwError.
pub type Result<T> = std::result::Result<T, SwError>;
