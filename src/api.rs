//! Records/invoicing REST API client.
//!
//! [`RemoteApi`] is the seam the sync engine and resync talk to;
//! [`HttpApi`] is the reqwest implementation used in production. Each
//! entity kind is a REST collection (`/api/invoices`, `/api/records`, ...)
//! authenticated with the identity provider's bearer session token.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::entities::EntityKind;
use crate::sanitize::salvage_id;
use crate::storage::Session;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight connectivity check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Cannot reach server at {0}")]
    Network(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Session is invalid or expired (HTTP 401)")]
    Unauthorized,

    #[error("Not authorized for this action (HTTP 403)")]
    Forbidden,

    #[error("Not found (HTTP 404)")]
    NotFound,

    #[error("{0} (HTTP 402)")]
    QuotaExceeded(String),

    #[error("{message} (HTTP {status})")]
    Validation { status: u16, message: String },

    #[error("Server is busy, retry later (HTTP 429)")]
    RateLimited { retry_after: Option<u64> },

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Timeout(_)
                | ApiError::RateLimited { .. }
                | ApiError::Server { .. }
                | ApiError::InvalidResponse(_)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map a non-success HTTP response to an error, keeping the server's
    /// message so it ends up in the queue entry's `last_error`.
    pub fn from_response(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        let message = extract_error_message(body)
            .unwrap_or_else(|| default_status_message(status).to_string());
        match status {
            401 => ApiError::Unauthorized,
            402 => ApiError::QuotaExceeded(message),
            403 => ApiError::Forbidden,
            404 => ApiError::NotFound,
            429 => ApiError::RateLimited {
                retry_after: retry_after.or_else(|| retry_after_from_body(body)),
            },
            s if s >= 500 => ApiError::Server { status: s, message },
            s => ApiError::Validation { status: s, message },
        }
    }
}

fn default_status_message(status: u16) -> &'static str {
    match status {
        400 => "Invalid request",
        409 => "Conflicts with existing data",
        422 => "Validation failed",
        s if s >= 500 => "Internal server error",
        _ => "Unexpected response from server",
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body.trim()).ok()?;
    let message = json
        .get("error")
        .or_else(|| json.get("message"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    match json.get("details").or_else(|| json.get("errors")) {
        Some(details) if !details.is_null() => Some(format!("{message}: {details}")),
        _ => Some(message),
    }
}

fn retry_after_from_body(body: &str) -> Option<u64> {
    let json: Value = serde_json::from_str(body.trim()).ok()?;
    json.get("retryAfter")
        .or_else(|| json.get("retry_after_seconds"))
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
}

fn transport_error(base: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(base.to_string());
    }
    if err.is_builder() {
        return ApiError::InvalidUrl(base.to_string());
    }
    if err.is_connect() {
        return ApiError::Network(base.to_string());
    }
    ApiError::Network(format!("{base}: {err}"))
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// Server-assigned id of a document (`_id`, falling back to `id`).
pub fn server_id(doc: &Value) -> Option<String> {
    salvage_id(doc)
}

/// Unwrap `{ "data": {...} }` style single-document responses.
pub fn unwrap_document(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Unwrap a collection response: a bare array, `{ data: [...] }`,
/// `{ <wireName>: [...] }` or `{ items: [...] }`.
pub fn unwrap_collection(kind: EntityKind, body: Value) -> Result<Vec<Value>, ApiError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => ["data", kind.as_str(), "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!("no {} array in list response", kind.as_str()))
            }),
        other => Err(ApiError::InvalidResponse(format!(
            "expected a list of {}, got {}",
            kind.as_str(),
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn encode_path_segment(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Remote API seam
// ---------------------------------------------------------------------------

/// Call/response contract of the records/invoicing backend.
pub trait RemoteApi: Send + Sync {
    /// Create a document; returns the server's copy (with its `_id`).
    fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// Apply a partial update; returns the server's copy when it sends one.
    fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<Option<Value>, ApiError>> + Send;

    fn delete(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// The authenticated user's full collection.
    fn list(&self, kind: EntityKind) -> impl Future<Output = Result<Vec<Value>, ApiError>> + Send;

    /// Lightweight connectivity check.
    fn health(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// reqwest-backed [`RemoteApi`].
pub struct HttpApi {
    client: Client,
    base_url: String,
    session: Session,
}

impl HttpApi {
    pub fn new(base_url: &str, session: Session, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidUrl(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<Value>, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(self.session.token())
            .header("Accept", "application/json");
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        debug!(method = %method, path, "API request");
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ApiError::from_response(status.as_u16(), &body_text, retry_after));
        }
        if status == StatusCode::NO_CONTENT || body_text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body_text)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

impl RemoteApi for HttpApi {
    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<Value, ApiError> {
        let body = self
            .send(Method::POST, kind.api_path(), Some(payload), Some(idempotency_key))
            .await?
            .ok_or_else(|| ApiError::InvalidResponse("empty create response".into()))?;
        Ok(unwrap_document(body))
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Option<Value>, ApiError> {
        let path = format!("{}/{}", kind.api_path(), encode_path_segment(id));
        Ok(self
            .send(Method::PUT, &path, Some(payload), None)
            .await?
            .map(unwrap_document))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}", kind.api_path(), encode_path_segment(id));
        self.send(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, ApiError> {
        match self.send(Method::GET, kind.api_path(), None, None).await? {
            Some(body) => unwrap_collection(kind, body),
            None => Ok(Vec::new()),
        }
    }

    async fn health(&self) -> Result<(), ApiError> {
        let url = format!("{}/api/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        if status.is_success() {
            debug!("Connectivity check passed");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ApiError::from_response(status.as_u16(), &body, None))
        }
    }
}
