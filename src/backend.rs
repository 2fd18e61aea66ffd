//! Backend order service client.
//!
//! `OrderBackend` is the contract the sync core needs from the order
//! service; `HttpOrderBackend` implements it over HTTPS. Every response is
//! classified as success, transient failure, conflict or rejection so the
//! callers can decide between retry, rollback and surfacing an error.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::BackendCredentials;
use crate::error::BackendError;
use crate::model::{LocationSample, OrderStatus, PaymentCollection, RemoteAssignment};

/// Timeout used specifically for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of the order-list read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSnapshot {
    #[serde(default)]
    pub orders: Vec<RemoteAssignment>,
    /// Dispatcher/status notifications to show the agent.
    #[serde(default)]
    pub notifications: Vec<String>,
}

/// Contract of the backend order service.
///
/// Status transitions are idempotent on `(order_id, target)` and payments on
/// `order_id`; submitting the same key twice must be a no-op server-side.
#[async_trait]
pub trait OrderBackend: Send + Sync {
    async fn push_location(&self, sample: &LocationSample) -> Result<(), BackendError>;

    async fn transition_status(
        &self,
        order_id: &str,
        target: OrderStatus,
        idempotency_key: &str,
    ) -> Result<(), BackendError>;

    async fn submit_payment(&self, collection: &PaymentCollection) -> Result<(), BackendError>;

    async fn fetch_assignments(&self) -> Result<AssignmentSnapshot, BackendError>;

    /// Lightweight reachability check. Never errors.
    async fn health_check(&self) -> bool;
}

/// Bound a backend call; hitting the limit counts as a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Transient(format!(
            "request timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
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

    // Again, in case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// `{base_url}/{segments...}` with each segment percent-encoded.
fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, BackendError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| BackendError::Rejected(format!("Invalid backend URL {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| BackendError::Rejected(format!("Backend URL {base_url} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a classified backend error.
fn friendly_error(url: &str, err: &reqwest::Error) -> BackendError {
    if err.is_connect() {
        return BackendError::Transient(format!("Cannot reach order service at {url}"));
    }
    if err.is_timeout() {
        return BackendError::Transient(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return BackendError::Rejected(format!("Invalid order service URL: {url}"));
    }
    BackendError::Transient(format!("Network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Agent API key is invalid or expired".to_string(),
        403 => "Agent not authorized for this order".to_string(),
        404 => "Order not found".to_string(),
        409 => "Order state changed on the server".to_string(),
        s if s >= 500 => format!("Order service error (HTTP {s})"),
        s => format!("Unexpected response from order service (HTTP {s})"),
    }
}

/// Classify a non-success response.
///
/// 409 is a conflict carrying the server's current status when present;
/// timeouts, throttling and 5xx are transient; anything else is a terminal
/// rejection.
pub fn classify_failure(status: StatusCode, body_text: &str) -> BackendError {
    let json = serde_json::from_str::<Value>(body_text).ok();
    let message = json
        .as_ref()
        .and_then(|j| j.get("error").or_else(|| j.get("message")))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| status_message(status));
    let detail = format!("{message} (HTTP {})", status.as_u16());

    match status.as_u16() {
        409 => {
            let server_status = json
                .as_ref()
                .and_then(|j| {
                    j.get("currentStatus")
                        .or_else(|| j.get("current_status"))
                        .or_else(|| j.get("status"))
                })
                .and_then(Value::as_str)
                .and_then(OrderStatus::parse);
            BackendError::Conflict {
                server_status,
                message: detail,
            }
        }
        408 | 425 | 429 => BackendError::Transient(detail),
        s if s >= 500 => BackendError::Transient(detail),
        _ => BackendError::Rejected(detail),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpOrderBackend {
    base_url: String,
    agent_id: String,
    api_key: Zeroizing<String>,
    client: Client,
}

impl HttpOrderBackend {
    pub fn new(credentials: &BackendCredentials, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url: normalize_backend_url(&credentials.base_url),
            agent_id: credentials.agent_id.clone(),
            api_key: credentials.api_key.clone(),
            client,
        })
    }

    /// Perform an authenticated request against `{base_url}/{segments...}`.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, BackendError> {
        let url = endpoint(&self.base_url, segments)?;
        let path = url.path().to_string();

        let mut req = self
            .client
            .request(method.clone(), url)
            .header("X-Agent-Api-Key", self.api_key.as_str())
            .header("X-Agent-Id", &self.agent_id);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        debug!(
            %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "order service response"
        );

        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let err = classify_failure(status, &body_text);
            warn!(%method, path = %path, error = %err, "order service request failed");
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            BackendError::Transient(format!("Invalid JSON from order service: {e}"))
        })
    }
}

#[async_trait]
impl OrderBackend for HttpOrderBackend {
    async fn push_location(&self, sample: &LocationSample) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "agentId": self.agent_id,
            "latitude": sample.latitude,
            "longitude": sample.longitude,
            "accuracyMeters": sample.accuracy_meters,
            "capturedAt": sample.captured_at.to_rfc3339(),
            "batteryPercent": sample.battery_percent,
        });
        let key = format!("location:{}", sample.captured_at.timestamp_millis());
        self.send(
            Method::POST,
            &["api", "agent", "locations"],
            Some(body),
            Some(&key),
        )
            .await
            .map(|_| ())
    }

    async fn transition_status(
        &self,
        order_id: &str,
        target: OrderStatus,
        idempotency_key: &str,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "agentId": self.agent_id,
            "status": target.as_str(),
        });
        self.send(
            Method::POST,
            &["api", "agent", "orders", order_id, "status"],
            Some(body),
            Some(idempotency_key),
        )
            .await
            .map(|_| ())
    }

    async fn submit_payment(&self, collection: &PaymentCollection) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "agentId": self.agent_id,
            "paymentId": collection.id,
            "orderId": collection.order_id,
            "orderTotalCents": collection.order_total.cents(),
            "collectedCents": collection.collected_amount.cents(),
            "changeCents": collection.change_given.cents(),
            "notes": collection.notes,
            "collectedAt": collection.collected_at.to_rfc3339(),
        });
        let key = format!("payment:{}", collection.order_id);
        self.send(
            Method::POST,
            &["api", "agent", "orders", collection.order_id.as_str(), "payment"],
            Some(body),
            Some(&key),
        )
            .await
            .map(|_| ())
    }

    async fn fetch_assignments(&self) -> Result<AssignmentSnapshot, BackendError> {
        let value = self
            .send(Method::GET, &["api", "agent", "orders"], None, None)
            .await?;
        parse_snapshot(value)
    }

    async fn health_check(&self) -> bool {
        let Ok(url) = endpoint(&self.base_url, &["api", "health"]) else {
            return false;
        };
        match self
            .client
            .head(url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-Agent-Api-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

/// Accept either `{ "orders": [...], "notifications": [...] }` or a bare array.
fn parse_snapshot(value: Value) -> Result<AssignmentSnapshot, BackendError> {
    let parsed = match value {
        Value::Null => Ok(AssignmentSnapshot::default()),
        Value::Array(_) => serde_json::from_value::<Vec<RemoteAssignment>>(value).map(|orders| {
            AssignmentSnapshot {
                orders,
                notifications: Vec::new(),
            }
        }),
        other => serde_json::from_value::<AssignmentSnapshot>(other),
    };
    parsed.map_err(|e| {
        BackendError::Transient(format!("Unreadable order list from order service: {e}"))
    })
}

/// Test connectivity with a one-off health check and log the latency.
pub async fn test_connectivity(backend: &dyn OrderBackend) -> Option<u64> {
    let start = Instant::now();
    if backend.health_check().await {
        let latency = start.elapsed().as_millis() as u64;
        info!(latency_ms = latency, "connectivity test passed");
        Some(latency)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Money, PaymentMethod};

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("orders.example.com/api/"),
            "https://orders.example.com"
        );
        assert_eq!(normalize_backend_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(
            normalize_backend_url("  https://orders.example.com///  "),
            "https://orders.example.com"
        );
        assert_eq!(
            normalize_backend_url("http://10.0.0.5:3000/api"),
            "http://10.0.0.5:3000"
        );
    }

    #[test]
    fn test_endpoint_encodes_order_ids() {
        let url = endpoint("https://orders.example.com", &["api", "agent", "orders", "ord-1"]).unwrap();
        assert_eq!(url.as_str(), "https://orders.example.com/api/agent/orders/ord-1");

        let url = endpoint(
            "https://orders.example.com",
            &["api", "agent", "orders", "a/b c", "status"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://orders.example.com/api/agent/orders/a%2Fb%20c/status"
        );

        let url = endpoint("http://10.0.0.5:3000/courier", &["api", "health"]).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:3000/courier/api/health");

        assert!(endpoint("not a url", &["api"]).is_err());
    }

    #[test]
    fn test_conflict_carries_server_status() {
        let err = classify_failure(
            StatusCode::CONFLICT,
            r#"{"error":"Order reassigned","currentStatus":"accepted"}"#,
        );
        assert_eq!(
            err,
            BackendError::Conflict {
                server_status: Some(OrderStatus::Accepted),
                message: "Order reassigned (HTTP 409)".into(),
            }
        );

        let err = classify_failure(StatusCode::CONFLICT, "");
        assert!(matches!(
            err,
            BackendError::Conflict {
                server_status: None,
                ..
            }
        ));
    }

    #[test]
    fn test_failure_classification() {
        assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_failure(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert_eq!(
            classify_failure(StatusCode::FORBIDDEN, r#"{"message":"wrong agent"}"#),
            BackendError::Rejected("wrong agent (HTTP 403)".into())
        );
        assert_eq!(
            classify_failure(StatusCode::UNAUTHORIZED, "not json"),
            BackendError::Rejected("Agent API key is invalid or expired (HTTP 401)".into())
        );
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, ""),
            BackendError::Rejected(_)
        ));
    }

    #[test]
    fn test_parse_snapshot_accepts_object_or_array() {
        let object = serde_json::json!({
            "orders": [{
                "orderId": "ord-1",
                "status": "picked_up",
                "paymentMethod": "cod",
                "totalAmount": 1000
            }],
            "notifications": ["Order ord-2 was reassigned"]
        });
        let snapshot = parse_snapshot(object).unwrap();
        assert_eq!(snapshot.orders.len(), 1);
        assert_eq!(snapshot.orders[0].status, OrderStatus::PickedUp);
        assert_eq!(snapshot.orders[0].payment_method, PaymentMethod::CashOnDelivery);
        assert_eq!(snapshot.orders[0].total_amount, Money::from_cents(1000));
        assert_eq!(snapshot.notifications.len(), 1);

        let array = serde_json::json!([{
            "orderId": "ord-3",
            "status": "assigned",
            "paymentMethod": "prepaid",
            "totalCents": 2599
        }]);
        let snapshot = parse_snapshot(array).unwrap();
        assert_eq!(snapshot.orders[0].total_amount, Money::from_cents(2599));
        assert!(snapshot.notifications.is_empty());

        assert_eq!(parse_snapshot(Value::Null).unwrap(), AssignmentSnapshot::default());
        assert!(parse_snapshot(serde_json::json!({"orders": "nope"})).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed_to_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BackendError>(())
        };
        let err = with_timeout(Duration::from_secs(15), slow).await.unwrap_err();
        assert_eq!(
            err,
            BackendError::Transient("request timed out after 15000ms".into())
        );

        let fast = async { Ok::<_, BackendError>(7) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
