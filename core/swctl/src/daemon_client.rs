//! Client side of the edge worker socket protocol.

use chrono::Utc;
use coachly_sw_protocol::{
    ClientMessage, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CliError, Result};

const SOCKET_ENV: &str = "COACHLY_SW_SOCKET";
// Fetches may wait on the upstream timeout, so reads get more room than writes.
const READ_TIMEOUT_SECS: u64 = 45;
const WRITE_TIMEOUT_MS: u64 = 600;

pub fn socket_path() -> Result<PathBuf> {
    match env::var_os(SOCKET_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(sw_core::default_socket_path()?),
    }
}

/// Sends one request and decodes the `data` of a successful response.
pub fn call<T: DeserializeOwned>(method: Method, params: Option<Value>) -> Result<T> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_request_id()),
        params,
    };
    tracing::debug!(method = ?request.method, id = ?request.id, "Sending daemon request");

    let mut stream = connect()?;
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    write_request(&mut stream, &request)?;
    let response = read_response(&mut stream)?;
    decode(response)
}

/// Subscribes to client messages and hands each one to `on_message` until
/// the daemon closes the stream or `on_message` returns false.
pub fn listen<F>(mut on_message: F) -> Result<()>
where
    F: FnMut(ClientMessage) -> bool,
{
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Subscribe,
        id: Some(make_request_id()),
        params: None,
    };

    let mut stream = connect()?;
    write_request(&mut stream, &request)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    read_line(&mut reader, &mut line)?;
    let ack: Response = serde_json::from_str(&line)
        .map_err(|err| CliError::BadResponse(format!("subscribe ack: {}", err)))?;
    let _: Value = decode(ack)?;

    loop {
        line.clear();
        if read_line(&mut reader, &mut line)? == 0 {
            tracing::info!("Daemon closed the subscription");
            return Ok(());
        }
        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(message) => {
                if !on_message(message) {
                    return Ok(());
                }
            }
            Err(err) => tracing::warn!(error = %err, "Skipping malformed client message"),
        }
    }
}

fn connect() -> Result<UnixStream> {
    let socket = socket_path()?;
    let stream = UnixStream::connect(&socket).map_err(|err| CliError::Unreachable {
        socket: socket.display().to_string(),
        reason: err.to_string(),
    })?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<()> {
    let io_err = |err: std::io::Error| CliError::BadResponse(format!("write failed: {}", err));
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| CliError::BadResponse(format!("Failed to write request: {}", err)))?;
    stream.write_all(b"\n").map_err(io_err)?;
    stream.flush().map_err(io_err)
}

fn read_line(reader: &mut BufReader<UnixStream>, line: &mut String) -> Result<usize> {
    reader
        .read_line(line)
        .map_err(|err| CliError::BadResponse(format!("Failed to read stream: {}", err)))
}

fn read_response(stream: &mut UnixStream) -> Result<Response> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES * 2 {
                    return Err(CliError::BadResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(CliError::BadResponse(
                    "timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => {
                return Err(CliError::BadResponse(format!(
                    "failed to read response: {}",
                    err
                )))
            }
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(CliError::BadResponse("response was empty".to_string()));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| CliError::BadResponse(format!("invalid JSON: {}", err)))
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.ok {
        return Err(match response.error {
            Some(err) => CliError::Daemon {
                code: err.code,
                message: err.message,
            },
            None => CliError::BadResponse("error response without details".to_string()),
        });
    }
    let data = response.data.unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|err| CliError::BadResponse(err.to_string()))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "swctl-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u32()
    )
}
