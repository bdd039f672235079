use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, LAST_MODIFIED, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ApiSettings, RetryPolicy};
use crate::domain::{RecordKey, ResourceKind};
use crate::error::{FetchError, FetchErrorKind, SyncError};
use crate::records::{IsothermDetail, RecordBatch, parse_collection, parse_isotherm_detail};

/// Process-wide spacing of outbound requests.
///
/// Callers reserve the next free slot under the lock and sleep outside it, so
/// concurrent fetch loops sharing one gate are serialized at
/// `min_interval` spacing without holding the lock while waiting.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            next_slot: Mutex::new(None),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Blocks until the caller may send one request.
    pub fn wait(&self) {
        let slot = {
            let mut next = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        let now = Instant::now();
        if slot > now {
            thread::sleep(slot - now);
        }
    }
}

pub trait IsodbClient: Send + Sync {
    fn fetch(&self, kind: ResourceKind) -> Result<RecordBatch, SyncError>;

    /// Raw `isotherms.json` listing, used for per-material isotherm counts.
    fn fetch_isotherm_index(&self) -> Result<Value, SyncError>;

    fn fetch_isotherm(&self, filename: &RecordKey) -> Result<IsothermDetail, SyncError>;
}

#[derive(Clone)]
pub struct IsodbHttpClient {
    client: Client,
    base_url: String,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
}

impl IsodbHttpClient {
    pub fn new(settings: &ApiSettings, gate: Arc<RateGate>) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("isodb-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            gate,
            retry: settings.retry,
        })
    }

    pub fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/{}", self.base_url, kind.endpoint())
    }

    pub fn isotherm_url(&self, filename: &RecordKey) -> String {
        format!("{}/isotherm/{}.json", self.base_url, filename.as_str())
    }

    fn get_json(&self, url: &str) -> Result<(Value, Option<String>), FetchError> {
        let response = self.send_with_retries(url, || self.client.get(url))?;
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .json::<Value>()
            .map_err(|err| FetchError::fatal(url, format!("malformed response body: {err}")))?;
        Ok((body, last_modified))
    }

    /// Sends through the rate gate, retrying retryable failures with
    /// exponential backoff. Every attempt passes the gate.
    fn send_with_retries<F>(&self, url: &str, mut make_req: F) -> Result<Response, FetchError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            self.gate.wait();
            let failure = match make_req().send() {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let message = resp
                        .text()
                        .unwrap_or_else(|_| "ISODB request failed".to_string());
                    FetchError {
                        kind: classify_status(status),
                        url: url.to_string(),
                        status: Some(status),
                        attempts: attempt + 1,
                        message: truncate(&message, 200),
                    }
                }
                Err(err) => FetchError {
                    kind: classify_transport(&err),
                    url: url.to_string(),
                    status: err.status().map(|status| status.as_u16()),
                    attempts: attempt + 1,
                    message: err.to_string(),
                },
            };

            attempt += 1;
            if !failure.is_retryable() || attempt >= self.retry.max_attempts {
                if failure.is_retryable() {
                    warn!(url, attempts = attempt, "giving up after retryable failures");
                }
                return Err(failure);
            }
            let delay = self.retry.backoff(attempt - 1);
            debug!(url, attempt, delay_ms = delay.as_millis() as u64, error = %failure.message, "retrying");
            thread::sleep(delay);
        }
    }
}

impl IsodbClient for IsodbHttpClient {
    fn fetch(&self, kind: ResourceKind) -> Result<RecordBatch, SyncError> {
        let url = self.collection_url(kind);
        let (body, last_modified) = self.get_json(&url)?;
        parse_collection(kind, &body, last_modified)
    }

    fn fetch_isotherm_index(&self) -> Result<Value, SyncError> {
        let url = self.collection_url(ResourceKind::Isotherms);
        let (body, _) = self.get_json(&url)?;
        Ok(body)
    }

    fn fetch_isotherm(&self, filename: &RecordKey) -> Result<IsothermDetail, SyncError> {
        let url = self.isotherm_url(filename);
        let (body, _) = self.get_json(&url)?;
        parse_isotherm_detail(filename, &body)
            .map_err(|err| FetchError::fatal(&url, err.to_string()).into())
    }
}

pub fn classify_status(status: u16) -> FetchErrorKind {
    match status {
        408 | 429 | 500..=599 => FetchErrorKind::Retryable,
        _ => FetchErrorKind::Fatal,
    }
}

fn classify_transport(err: &reqwest::Error) -> FetchErrorKind {
    if err.is_decode() || err.is_builder() {
        return FetchErrorKind::Fatal;
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return FetchErrorKind::Retryable;
    }
    match err.status() {
        Some(status) => classify_status(status.as_u16()),
        None => FetchErrorKind::Retryable,
    }
}

fn truncate(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &message[..idx]),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use assert_matches::assert_matches;

    use super::*;

    /// Serves one canned response per connection, in order, and returns how
    /// many requests were answered.
    fn stub_server(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut served = 0;
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    let read = stream.read(&mut buf).unwrap();
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..read]);
                }
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
                served += 1;
            }
            served
        });
        (base_url, handle)
    }

    fn stub_client(base_url: String, max_attempts: u32, gate: Arc<RateGate>) -> IsodbHttpClient {
        let settings = ApiSettings {
            base_url,
            min_request_interval: gate.min_interval(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        };
        IsodbHttpClient::new(&settings, gate).unwrap()
    }

    #[test]
    fn retries_unavailable_until_success() {
        let (base_url, server) = stub_server(vec![
            (503, "busy"),
            (503, "busy"),
            (200, r#"[{"InChIKey": "CURLTUGMZLYLDI-UHFFFAOYSA-N", "name": "CO2"}]"#),
        ]);
        let client = stub_client(base_url, 4, RateGate::new(Duration::from_millis(20)));
        let start = Instant::now();
        let batch = client.fetch(ResourceKind::Gases).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(server.join().unwrap(), 3);
        // three attempts through the gate: two full intervals
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn not_found_is_not_retried() {
        let (base_url, server) = stub_server(vec![(404, "missing")]);
        let client = stub_client(base_url, 4, RateGate::new(Duration::ZERO));
        let key: RecordKey = "absent.Isotherm1".parse().unwrap();
        let err = client.fetch_isotherm(&key).unwrap_err();
        assert_matches!(
            err,
            SyncError::Fetch(FetchError {
                kind: FetchErrorKind::Fatal,
                status: Some(404),
                attempts: 1,
                ..
            })
        );
        assert_eq!(server.join().unwrap(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (base_url, server) = stub_server(vec![(503, "busy"), (503, "busy"), (503, "busy")]);
        let client = stub_client(base_url, 3, RateGate::new(Duration::ZERO));
        let err = client.fetch(ResourceKind::Materials).unwrap_err();
        assert_matches!(
            err,
            SyncError::Fetch(FetchError {
                kind: FetchErrorKind::Retryable,
                status: Some(503),
                attempts: 3,
                ..
            })
        );
        assert_eq!(server.join().unwrap(), 3);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(503), FetchErrorKind::Retryable);
        assert_eq!(classify_status(500), FetchErrorKind::Retryable);
        assert_eq!(classify_status(429), FetchErrorKind::Retryable);
        assert_eq!(classify_status(408), FetchErrorKind::Retryable);
        assert_eq!(classify_status(404), FetchErrorKind::Fatal);
        assert_eq!(classify_status(400), FetchErrorKind::Fatal);
        assert_eq!(classify_status(403), FetchErrorKind::Fatal);
    }

    #[test]
    fn gate_spaces_consecutive_calls() {
        let gate = RateGate::new(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..4 {
            gate.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn gate_is_shared_across_threads() {
        let gate = RateGate::new(Duration::from_millis(15));
        let start = Instant::now();
        let handles = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    gate.wait();
                    gate.wait();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        // six slots, the first is immediate
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[test]
    fn urls_follow_base() {
        let settings = ApiSettings {
            base_url: "http://localhost:9/isodb/api".to_string(),
            ..ApiSettings::default()
        };
        let client = IsodbHttpClient::new(&settings, RateGate::new(Duration::ZERO)).unwrap();
        assert_eq!(
            client.collection_url(ResourceKind::Bibliography),
            "http://localhost:9/isodb/api/biblio.json"
        );
        let key: RecordKey = "abc.Isotherm1".parse().unwrap();
        assert_eq!(
            client.isotherm_url(&key),
            "http://localhost:9/isodb/api/isotherm/abc.Isotherm1.json"
        );
    }

    #[test]
    fn truncates_long_messages() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long, 10).chars().count(), 11);
        assert_eq!(truncate("short", 10), "short");
    }
}
