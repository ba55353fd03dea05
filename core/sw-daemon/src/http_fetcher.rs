//! HTTP implementation of the worker's network seam.

use std::collections::BTreeMap;
use std::time::Duration;

use coachly_sw_protocol::{FetchRequest, FetchResponse, ResponseSource};
use reqwest::blocking::Client;
use sw_core::{FetchError, Fetcher};
use tracing::debug;

const PROBE_TIMEOUT_SECS: u64 = 5;
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie"];

pub struct HttpFetcher {
    client: Client,
    probe_url: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, probe_url: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coachly-sw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            probe_url,
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_builder() {
            FetchError::InvalidRequest(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| FetchError::InvalidRequest(err.to_string()))?;
        let omit_credentials = request.credentials.as_deref() == Some("omit");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            if omit_credentials && is_credential_header(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(referrer) = request.referrer.as_deref().filter(|r| !r.is_empty()) {
            builder = builder.header(reqwest::header::REFERER, referrer);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|err| self.classify(err))?;
        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        // The status line arrived, so the backend already has the request.
        let body = response
            .bytes()
            .map_err(|err| FetchError::Interrupted(err.to_string()))?
            .to_vec();

        debug!(
            method = request.method.as_str(),
            url = %request.url,
            status,
            bytes = body.len(),
            "Upstream response"
        );
        Ok(FetchResponse {
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }

    fn probe(&self) -> bool {
        match self
            .client
            .head(&self.probe_url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
        {
            Ok(_) => true,
            Err(err) => {
                debug!(url = %self.probe_url, error = %err, "Connectivity probe failed");
                false
            }
        }
    }
}

fn is_credential_header(name: &str) -> bool {
    CREDENTIAL_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachly_sw_protocol::HttpMethod;

    #[test]
    fn credential_headers_match_case_insensitively() {
        assert!(is_credential_header("Authorization"));
        assert!(is_credential_header("COOKIE"));
        assert!(!is_credential_header("content-type"));
    }

    #[test]
    fn truncated_body_is_reported_as_interrupted() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n{}") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            stream
                .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 100\r\n\r\npartial")
                .expect("write");
        });

        let fetcher = HttpFetcher::new(Duration::from_secs(5), format!("http://{}/", addr))
            .expect("client");
        let err = fetcher
            .fetch(
                &FetchRequest::new(HttpMethod::Post, format!("http://{}/api/notes", addr))
                    .with_body("{}"),
            )
            .unwrap_err();
        server.join().expect("server thread");

        assert!(matches!(err, FetchError::Interrupted(_)));
        assert!(err.reached_backend());
    }

    #[test]
    fn unreachable_host_is_a_network_failure() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2), "http://127.0.0.1:9/".to_string())
            .expect("client");
        let err = fetcher
            .fetch(&FetchRequest::new(HttpMethod::Post, "http://127.0.0.1:9/api/notes"))
            .unwrap_err();
        assert!(err.is_network_failure());
        assert!(!fetcher.probe());
    }
}
