//! Admin dashboard sync transport.
//!
//! `SyncTransport` is the seam between the sync engine and the network. The
//! production implementation, [`HttpTransport`], pushes queue payloads to the
//! admin dashboard's POS endpoints and classifies failures so the engine can
//! decide between retrying, deferring and failing a queue record.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{EntityType, SyncOperation, SyncQueueRecord};
use crate::network::ReachabilityProbe;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the health probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const API_KEY_HEADER: &str = "X-POS-API-Key";
const TENANT_HEADER: &str = "x-tenant-id";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ---------------------------------------------------------------------------
// URL and connection string handling
// ---------------------------------------------------------------------------

/// Normalise the dashboard base URL: add a scheme (http only for local
/// hosts), drop trailing slashes and a trailing `/api` segment.
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        let local = url.starts_with("localhost") || url.starts_with("127.0.0.1");
        url = format!("{}://{url}", if local { "http" } else { "https" });
    }
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

/// Fields carried by an onboarding connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub tenant_id: Option<String>,
}

/// Decode a connection string: either raw JSON or URL-safe base64 JSON with
/// `url`, `key` and `tid`/`tenantId` fields.
pub fn decode_connection_string(raw: &str) -> Option<ConnectionString> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let payload: Value = if compact.starts_with('{') {
        serde_json::from_str(&compact).ok()?
    } else {
        let standard = compact.replace('-', "+").replace('_', "/");
        let padding = (4 - standard.len() % 4) % 4;
        let decoded = BASE64_STANDARD
            .decode(format!("{standard}{}", "=".repeat(padding)))
            .ok()?;
        serde_json::from_slice(&decoded).ok()?
    };

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| payload.get(*name).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let parsed = ConnectionString {
        url: field(&["url"]).map(|u| normalize_base_url(&u)),
        api_key: field(&["key", "apiKey"]),
        tenant_id: field(&["tid", "tenantId"]),
    };
    if parsed == ConnectionString::default() {
        return None;
    }
    Some(parsed)
}

// ---------------------------------------------------------------------------
// Requests, acks and errors
// ---------------------------------------------------------------------------

/// One queue record as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub entity_type: EntityType,
    pub operation: SyncOperation,
    pub entity_id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub idempotency_key: String,
    pub payload: Value,
}

impl SyncRequest {
    pub fn from_record(record: &SyncQueueRecord, device_id: &str) -> serde_json::Result<Self> {
        Ok(Self {
            entity_type: record.entity_type(),
            operation: record.operation,
            entity_id: record.entity_id.clone(),
            tenant_id: record.tenant_id.clone(),
            device_id: device_id.to_string(),
            idempotency_key: record.idempotency_key.clone(),
            payload: record.payload.to_body()?,
        })
    }

    /// Entity fields plus the sync envelope (`operation`, `deviceId`,
    /// `idempotencyKey`).
    pub fn body(&self) -> Value {
        let mut body = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other.clone());
                map
            }
        };
        body.insert("operation".into(), Value::from(self.operation.as_str()));
        body.insert("deviceId".into(), Value::from(self.device_id.as_str()));
        body.insert(
            "idempotencyKey".into(),
            Value::from(self.idempotency_key.as_str()),
        );
        Value::Object(body)
    }
}

/// Server acknowledgement of a pushed record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncAck {
    pub invoice_number: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

impl SyncAck {
    /// Read an ack from a response body, accepting both a bare entity and a
    /// `{ "data": { ... } }` envelope.
    pub fn from_response(body: Value) -> Self {
        let entity = body.get("data").filter(|d| d.is_object()).unwrap_or(&body);
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| entity.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        Self {
            invoice_number: text(&["invoiceNumber", "invoice_number"]),
            status: text(&["status"]),
            raw: body.clone(),
        }
    }
}

/// How the sync engine should treat a failed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient: consume a retry and back off.
    Retryable,
    /// The server rejected the payload; retrying cannot help.
    Permanent,
    /// Credentials rejected; stop draining until they are fixed.
    ReauthRequired,
    /// Server asked us to slow down; defer without consuming a retry.
    Backpressure,
    /// Server holds a different version of the entity.
    Conflict,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{0}")]
    Network(String),

    #[error("{message} (HTTP {status})")]
    Http {
        status: u16,
        message: String,
        body: Option<Value>,
        retry_after_secs: Option<u64>,
    },

    #[error("invalid response from admin dashboard: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: None,
            retry_after_secs: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Http { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                409 => RetryClass::Conflict,
                429 => RetryClass::Backpressure,
                408 | 423 | 425 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Network(_) => RetryClass::Retryable,
            Self::Decode(_) => RetryClass::Retryable,
        }
    }

    /// Seconds the server asked us to wait, from the header or the body.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http {
                retry_after_secs,
                body,
                ..
            } => retry_after_secs
                .or_else(|| {
                    body.as_ref().and_then(|b| {
                        b.get("retryAfterSeconds")
                            .or_else(|| b.get("retry_after_seconds"))
                            .and_then(Value::as_u64)
                    })
                })
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            _ => None,
        }
    }

    /// The server's copy of the entity carried by a 409 response.
    pub fn server_version(&self) -> Option<&Value> {
        match self {
            Self::Http {
                status: 409,
                body: Some(body),
                ..
            } => ["serverVersion", "current", "data"]
                .iter()
                .find_map(|k| body.get(*k))
                .filter(|v| v.is_object()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Pushes one queue record to the server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, request: &SyncRequest) -> Result<SyncAck, TransportError>;
}

fn endpoint(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Invoice => "/api/pos/invoices",
        EntityType::Payment => "/api/pos/payments",
        EntityType::LineItem => "/api/pos/line-items",
    }
}

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Device not authorized for this tenant".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Entity was modified on the server".to_string(),
        429 => "Admin dashboard is rate limiting sync".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// reqwest-backed transport for the admin dashboard POS API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
    tenant_id: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: &str, tenant_id: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            tenant_id: tenant_id.trim().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `/api/health` and report latency on success.
    pub async fn check_health(&self) -> Result<u64, TransportError> {
        let url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| TransportError::Network(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::http(status.as_u16(), status_message(status)));
        }
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(latency_ms, "Admin dashboard health check passed");
        Ok(latency_ms)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, request: &SyncRequest) -> Result<SyncAck, TransportError> {
        let path = endpoint(request.entity_type);
        let (method, url) = match request.operation {
            SyncOperation::Create | SyncOperation::Update => {
                (Method::POST, format!("{}{path}", self.base_url))
            }
            SyncOperation::Delete => (
                Method::DELETE,
                format!("{}{path}/{}", self.base_url, request.entity_id),
            ),
        };

        let resp = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(TENANT_HEADER, &self.tenant_id)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&request.body())
            .send()
            .await
            .map_err(|e| TransportError::Network(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        let retry_after_secs = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body_text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&body_text).ok();

        if !status.is_success() {
            let message = body
                .as_ref()
                .and_then(|json| json.get("error").or_else(|| json.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_message(status));
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
                body,
                retry_after_secs,
            });
        }

        if body_text.trim().is_empty() {
            return Ok(SyncAck::default());
        }
        match body {
            Some(json) => Ok(SyncAck::from_response(json)),
            None => Err(TransportError::Decode(format!(
                "expected JSON body from {path}"
            ))),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpTransport {
    async fn is_reachable(&self) -> bool {
        match self.check_health().await {
            Ok(_) => true,
            Err(err) => {
                info!(error = %err, "Admin dashboard unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:3001//"),
            "http://localhost:3001"
        );
        assert_eq!(
            normalize_base_url(" https://admin.example.com "),
            "https://admin.example.com"
        );
    }

    #[test]
    fn test_decode_connection_string_base64() {
        let raw = BASE64_STANDARD.encode(
            json!({"url": "admin.example.com/api", "key": "k-123", "tid": "tenant-9"}).to_string(),
        );
        let decoded = decode_connection_string(&raw).expect("decodes");
        assert_eq!(decoded.url.as_deref(), Some("https://admin.example.com"));
        assert_eq!(decoded.api_key.as_deref(), Some("k-123"));
        assert_eq!(decoded.tenant_id.as_deref(), Some("tenant-9"));
    }

    #[test]
    fn test_decode_connection_string_rejects_garbage() {
        assert_eq!(decode_connection_string("not a connection string"), None);
        assert_eq!(decode_connection_string("{}"), None);
    }

    #[test]
    fn test_retry_classes() {
        let class = |status| TransportError::http(status, "x").retry_class();
        assert_eq!(class(401), RetryClass::ReauthRequired);
        assert_eq!(class(403), RetryClass::ReauthRequired);
        assert_eq!(class(409), RetryClass::Conflict);
        assert_eq!(class(429), RetryClass::Backpressure);
        assert_eq!(class(503), RetryClass::Retryable);
        assert_eq!(class(408), RetryClass::Retryable);
        assert_eq!(class(422), RetryClass::Permanent);
        assert_eq!(class(400), RetryClass::Permanent);
        assert_eq!(
            TransportError::Network("down".into()).retry_class(),
            RetryClass::Retryable
        );
    }

    #[test]
    fn test_retry_after_prefers_header_then_body() {
        let header = TransportError::Http {
            status: 429,
            message: "slow down".into(),
            body: Some(json!({"retryAfterSeconds": 99})),
            retry_after_secs: Some(12),
        };
        assert_eq!(header.retry_after(), Some(Duration::from_secs(12)));

        let body_only = TransportError::Http {
            status: 429,
            message: "slow down".into(),
            body: Some(json!({"retry_after_seconds": 7})),
            retry_after_secs: None,
        };
        assert_eq!(body_only.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_server_version_only_on_conflict() {
        let body = json!({"serverVersion": {"id": "inv-1", "status": "paid"}});
        let conflict = TransportError::Http {
            status: 409,
            message: "conflict".into(),
            body: Some(body.clone()),
            retry_after_secs: None,
        };
        assert_eq!(conflict.server_version(), Some(&body["serverVersion"]));

        let other = TransportError::Http {
            status: 422,
            message: "bad".into(),
            body: Some(body),
            retry_after_secs: None,
        };
        assert_eq!(other.server_version(), None);
    }

    #[test]
    fn test_request_body_carries_envelope() {
        let request = SyncRequest {
            entity_type: EntityType::Payment,
            operation: SyncOperation::Create,
            entity_id: "pay-1".into(),
            tenant_id: "tenant-1".into(),
            device_id: "dev-1".into(),
            idempotency_key: "abc".into(),
            payload: json!({"id": "pay-1", "amount": "10.00"}),
        };
        let body = request.body();
        assert_eq!(body["id"], "pay-1");
        assert_eq!(body["operation"], "create");
        assert_eq!(body["deviceId"], "dev-1");
        assert_eq!(body["idempotencyKey"], "abc");
    }

    #[test]
    fn test_ack_reads_enveloped_invoice_number() {
        let ack = SyncAck::from_response(json!({
            "success": true,
            "data": {"invoiceNumber": "INV-0042", "status": "paid"}
        }));
        assert_eq!(ack.invoice_number.as_deref(), Some("INV-0042"));
        assert_eq!(ack.status.as_deref(), Some("paid"));
    }
}
