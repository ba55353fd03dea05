//! Coachly edge worker daemon.
//!
//! Hosts one `ServiceWorker` behind a Unix socket. Clients send fetches
//! through it, trigger background sync, and subscribe to sync notifications.
//! A connectivity watcher replays queued mutations once the backend answers
//! probes again.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use coachly_sw_protocol::{
    parse_client_message, parse_fetch_request, parse_sync_tag, ErrorInfo, Method, Request,
    Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use sw_core::{CacheStorage, Fetcher, ServiceWorker, SwConfig, SwError};

mod http_fetcher;

use http_fetcher::HttpFetcher;

const SOCKET_ENV: &str = "COACHLY_SW_SOCKET";
const CONFIG_ENV: &str = "COACHLY_SW_CONFIG";
const DEBUG_ENV: &str = "COACHLY_SW_DEBUG_LOG";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const MIN_PROBE_INTERVAL_SECS: u64 = 1;

fn main() {
    init_logging();

    let config_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = match sw_core::load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load worker config; using defaults");
            SwConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    let worker = match build_worker(&config) {
        Ok(worker) => Arc::new(worker),
        Err(err) => {
            error!(error = %err, "Failed to initialize worker");
            std::process::exit(1);
        }
    };

    match worker.install() {
        Ok(state) => info!(version = %worker.version(), %state, "Worker installed"),
        Err(err) => {
            warn!(error = %err, "Worker install failed; requests pass straight to the network")
        }
    }

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        origin = %config.worker.origin,
        "Coachly edge worker started"
    );

    spawn_sync_watcher(
        Arc::clone(&worker),
        Duration::from_secs(config.sync.probe_interval_secs.max(MIN_PROBE_INTERVAL_SECS)),
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let worker = Arc::clone(&worker);
                thread::spawn(|| handle_connection(stream, worker));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn build_worker(config: &SwConfig) -> Result<ServiceWorker, SwError> {
    let db_path = config.db_path()?;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|source| SwError::Io {
            context: format!("Failed to create cache directory {}", parent.display()),
            source,
        })?;
    }
    let storage = Arc::new(CacheStorage::open(db_path, config.storage.quota_bytes)?);

    let fetcher = HttpFetcher::new(
        Duration::from_secs(config.network.timeout_secs),
        config.probe_url(),
    )
    .map_err(|err| SwError::InvalidRequest {
        code: "http_client".to_string(),
        message: format!("Failed to build HTTP client: {}", err),
    })?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);

    ServiceWorker::new(config, storage, fetcher)
}

/// Stands in for the browser's background-sync trigger: replay the queue
/// whenever the backend is reachable.
fn spawn_sync_watcher(worker: Arc<ServiceWorker>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if !worker.has_pending_sync() {
            continue;
        }
        if !worker.probe_network() {
            debug!("Backend unreachable; background sync deferred");
            continue;
        }
        let reports = worker.sync_all();
        info!(replayed = reports.len(), "Background sync ran");
    });
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, SwError> {
    match env::var_os(SOCKET_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => sw_core::default_socket_path(),
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, worker: Arc<ServiceWorker>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::Subscribe {
        stream_client_messages(stream, request.id, worker);
        return;
    }

    let response = handle_request(request, &worker);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, worker: &ServiceWorker) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => match worker.snapshot() {
            Ok(snapshot) => {
                let mut data = serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                });
                if let Ok(value) = serde_json::to_value(snapshot) {
                    data["worker"] = value;
                }
                Response::ok(id, data)
            }
            Err(err) => error_response(id, &err),
        },
        Method::Fetch => {
            let params = match request.params {
                Some(params) => params,
                None => return Response::error(id, "invalid_params", "fetch payload is required"),
            };
            let fetch = match parse_fetch_request(params) {
                Ok(fetch) => fetch,
                Err(err) => return Response::error_with_info(id, err),
            };
            debug!(method = fetch.method.as_str(), url = %fetch.url, "Fetch request");
            match worker.handle_fetch(fetch) {
                Ok(response) => to_response(id, &response, "fetch response"),
                Err(err) => error_response(id, &err),
            }
        }
        Method::Sync => match parse_sync_tag(request.params) {
            Ok(tag) => to_response(id, &worker.handle_sync(&tag), "sync report"),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SyncAll => to_response(id, &worker.sync_all(), "sync reports"),
        Method::Message => {
            let params = match request.params {
                Some(params) => params,
                None => return Response::error(id, "invalid_params", "message is required"),
            };
            let message = match parse_client_message(params) {
                Ok(message) => message,
                Err(err) => return Response::error_with_info(id, err),
            };
            info!(message = ?message, "Client message received");
            match worker.handle_message(message) {
                Ok(changed) => Response::ok(
                    id,
                    serde_json::json!({ "changed": changed, "state": worker.state() }),
                ),
                Err(err) => error_response(id, &err),
            }
        }
        Method::GetQueue => to_response(id, &worker.queue_summaries(), "queue"),
        Method::GetCaches => match worker.cache_summaries() {
            Ok(caches) => to_response(id, &caches, "caches"),
            Err(err) => error_response(id, &err),
        },
        // Subscriptions are routed in handle_connection.
        Method::Subscribe => Response::error(
            id,
            "invalid_method",
            "subscribe must be the only request on its connection",
        ),
    }
}

/// Keeps the connection open and writes one JSON line per broadcast until
/// the client goes away.
fn stream_client_messages(mut stream: UnixStream, id: Option<String>, worker: Arc<ServiceWorker>) {
    let (client_id, receiver) = worker.subscribe();
    info!(%client_id, "Client subscribed");

    let ack = Response::ok(
        id,
        serde_json::json!({ "subscribed": true, "client_id": client_id.to_string() }),
    );
    if write_response(&mut stream, ack).is_ok() {
        for message in receiver {
            if let Err(err) = write_line(&mut stream, &message) {
                debug!(%client_id, error = %err, "Subscriber disconnected");
                break;
            }
        }
    }

    worker.unsubscribe(&client_id);
    info!(%client_id, "Client unsubscribed");
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn error_response(id: Option<String>, err: &SwError) -> Response {
    warn!(code = err.code(), error = %err, "Request failed");
    Response::error(id, err.code(), err.to_string())
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    write_line(stream, &response)
}

fn write_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
