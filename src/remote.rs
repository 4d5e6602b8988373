//! Remote service client - the `save`/`fetch` contract against the HTTP API
//!
//! This module provides:
//! - The `Remote` trait the facade and sync scheduler deliver through
//! - `HttpRemote`, a reqwest implementation of `POST/GET /api/<endpoint>`
//! - `MockRemote`, an in-process stand-in with an on/off network switch

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::{Value, json};

/// Default per-attempt timeout
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Positive acknowledgement of a remote save.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAck {
    /// Identifier the service assigned, when it sent one
    pub server_id: Option<String>,
    /// Full response body
    pub body: Value,
}

impl RemoteAck {
    pub fn from_body(body: Value) -> Self {
        Self {
            server_id: extract_server_id(&body),
            body,
        }
    }
}

/// Errors that can occur talking to the remote service
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether trying again later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            RemoteError::InvalidResponse(_) => true,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(DEFAULT_REMOTE_TIMEOUT)
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

/// The remote service as seen by the persistence layer
#[async_trait]
pub trait Remote: Send + Sync {
    /// `POST /api/<endpoint>` with `payload` as the body.
    async fn save(&self, endpoint: &str, payload: &Value) -> Result<RemoteAck, RemoteError>;

    /// `GET /api/<endpoint>`.
    async fn fetch(&self, endpoint: &str) -> Result<Value, RemoteError>;
}

/// Save with a hard deadline, independent of the transport's own timeout.
pub async fn save_with_timeout(
    remote: &dyn Remote,
    endpoint: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<RemoteAck, RemoteError> {
    match tokio::time::timeout(timeout, remote.save(endpoint, payload)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Fetch with a hard deadline.
pub async fn fetch_with_timeout(remote: &dyn Remote, endpoint: &str, timeout: Duration) -> Result<Value, RemoteError> {
    match tokio::time::timeout(timeout, remote.fetch(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Pull the server-assigned identifier out of a response body.
///
/// Looks at `item.id`, then `item` itself, then a top-level `id`.
pub fn extract_server_id(body: &Value) -> Option<String> {
    fn scalar(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    body.get("item")
        .and_then(|item| item.get("id").and_then(scalar).or_else(|| scalar(item)))
        .or_else(|| body.get("id").and_then(scalar))
}

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

/// reqwest-backed remote
pub struct HttpRemote {
    client: Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// `{base_url}/api/{endpoint}`
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(|e| self.map_transport(e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    fn map_transport(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.config.timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn save(&self, endpoint: &str, payload: &Value) -> Result<RemoteAck, RemoteError> {
        let url = self.endpoint_url(endpoint);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let body = self.read_json(response).await?;
        Ok(RemoteAck::from_body(body))
    }

    async fn fetch(&self, endpoint: &str) -> Result<Value, RemoteError> {
        let url = self.endpoint_url(endpoint);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| self.map_transport(e))?;
        self.read_json(response).await
    }
}

/// In-process remote for tests and offline demos.
///
/// Starts online. While offline every call fails with a network error.
#[derive(Debug, Default)]
pub struct MockRemote {
    offline: AtomicBool,
    next_id: AtomicU64,
    delay: Mutex<Option<Duration>>,
    failing_endpoints: Mutex<HashSet<String>>,
    saved: Mutex<Vec<(String, Value)>>,
    attempts: AtomicU64,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that starts with the network down.
    pub fn offline() -> Self {
        let mock = Self::default();
        mock.set_online(false);
        mock
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Make saves to `endpoint` answer with HTTP 500.
    pub fn fail_endpoint(&self, endpoint: &str) {
        self.failing_endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.to_string());
    }

    pub fn heal_endpoint(&self, endpoint: &str) {
        self.failing_endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint);
    }

    /// Successful saves in arrival order.
    pub fn saved(&self) -> Vec<(String, Value)> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every save call, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Remote for MockRemote {
    async fn save(&self, endpoint: &str, payload: &Value) -> Result<RemoteAck, RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if !self.is_online() {
            return Err(RemoteError::Network("network unreachable".to_string()));
        }
        let failing = self
            .failing_endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(endpoint);
        if failing {
            return Err(RemoteError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((endpoint.to_string(), payload.clone()));

        Ok(RemoteAck::from_body(json!({"item": {"id": format!("srv-{}", id)}})))
    }

    async fn fetch(&self, endpoint: &str) -> Result<Value, RemoteError> {
        self.simulate_latency().await;

        if !self.is_online() {
            return Err(RemoteError::Network("network unreachable".to_string()));
        }

        let items: Vec<Value> = self
            .saved()
            .into_iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, p)| p)
            .collect();
        Ok(json!({ "items": items }))
    }
}
