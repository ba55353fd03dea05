//! Configuration loading and path resolution.
//!
//! Everything lives under `~/.coachly`:
//! - `sw.toml`: worker configuration (optional, defaults apply)
//! - `sw.sock`: daemon socket
//! - `sw/cache.db`: cache storage
//! - `logs/`: CLI log files

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Result, SwError};
use crate::precache::PrecacheEntry;

const COACHLY_DIR: &str = ".coachly";
const CONFIG_FILE: &str = "sw.toml";
const SOCKET_NAME: &str = "sw.sock";

pub const DEFAULT_ORIGIN: &str = "https://app.coachly.io";
pub const DEFAULT_APEX: &str = "coachly.io";

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Version recorded on activation. A changed version waits for
    /// `SKIP_WAITING` before taking over.
    #[serde(default = "default_worker_version")]
    pub version: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_shell_path")]
    pub shell_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: default_worker_version(),
            origin: default_origin(),
            shell_path: default_shell_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Hard limit on any single upstream request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Race window for network-first routes before falling back to cache.
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    #[serde(default)]
    pub probe_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            network_timeout_secs: default_network_timeout_secs(),
            probe_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            quota_bytes: default_quota_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    #[serde(default = "default_apex")]
    pub apex: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            apex: default_apex(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_precache")]
    pub precache: Vec<PrecacheEntry>,
    #[serde(default)]
    pub redirect: RedirectConfig,
}

impl Default for SwConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            precache: default_precache(),
            redirect: RedirectConfig::default(),
        }
    }
}

impl SwConfig {
    /// URL probed by the connectivity watcher; the origin when unset.
    pub fn probe_url(&self) -> String {
        self.network
            .probe_url
            .clone()
            .unwrap_or_else(|| self.worker.origin.clone())
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.storage.db_path {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }
}

fn default_worker_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_shell_path() -> String {
    "/index.html".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_network_timeout_secs() -> u64 {
    3
}

fn default_probe_interval_secs() -> u64 {
    15
}

fn default_quota_bytes() -> Option<u64> {
    Some(256 * 1024 * 1024)
}

fn default_apex() -> String {
    DEFAULT_APEX.to_string()
}

fn default_precache() -> Vec<PrecacheEntry> {
    vec![PrecacheEntry {
        url: default_shell_path(),
        revision: Some(default_worker_version()),
    }]
}

/// Returns the path to the Coachly directory (~/.coachly).
pub fn coachly_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(COACHLY_DIR))
        .ok_or(SwError::HomeDirNotFound)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(coachly_dir()?.join(CONFIG_FILE))
}

pub fn default_socket_path() -> Result<PathBuf> {
    Ok(coachly_dir()?.join(SOCKET_NAME))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(coachly_dir()?.join("sw").join("cache.db"))
}

pub fn default_log_dir() -> Result<PathBuf> {
    Ok(coachly_dir()?.join("logs"))
}

/// Loads the worker configuration, returning defaults if the file doesn't exist.
pub fn load_config(path: Option<PathBuf>) -> Result<SwConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(SwConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| SwError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source,
    })?;
    toml::from_str::<SwConfig>(&content).map_err(|err| SwError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
