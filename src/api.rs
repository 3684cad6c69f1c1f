//! Reference HTTP implementation of [`RemoteStore`].
//!
//! Speaks an authenticated REST/RPC convention against the cloud backend:
//! bulk reads under `/api/sync/{table}`, named procedures under
//! `/api/rpc/{name}`. Transport failures and HTTP statuses are mapped onto
//! the [`SyncError`] taxonomy so the queue and pull paths can classify
//! retryability without looking at reqwest types.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;
use crate::models::{Order, OrderItem, OrderStatus};
use crate::remote::{FetchFilter, RemoteStore};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
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

/// Convert a `reqwest::Error` into a classified [`SyncError`].
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_timeout() {
        return SyncError::Timeout(format!("connection to {url} timed out"));
    }
    if err.is_connect() {
        return SyncError::Network(format!("cannot reach backend at {url}"));
    }
    SyncError::Network(format!("network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP status onto the error taxonomy.
fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.canonical_reason().unwrap_or("request failed").into()
            } else {
                trimmed.to_string()
            }
        });

    match status.as_u16() {
        401 => SyncError::Unauthorized("api key is invalid or expired".into()),
        403 => SyncError::Unauthorized("terminal not authorized".into()),
        400 | 409 | 422 => SyncError::Validation(message),
        s => SyncError::Http { status: s, message },
    }
}

/// Authenticated HTTP client for the cloud backend.
pub struct HttpRemote {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
        })
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, method = %method, "remote request");

        let mut req = self
            .client
            .request(method, &url)
            .header("X-POS-API-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Serialization(format!("invalid JSON from backend: {e}")))
    }

    async fn rpc(&self, name: &str, body: Value) -> Result<(), SyncError> {
        self.request(Method::POST, &format!("/api/rpc/{name}"), Some(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(
        &self,
        table: &str,
        filter: &FetchFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, SyncError> {
        let mut path = format!("/api/sync/{table}?offset={offset}&limit={limit}");
        if let Some(since) = filter.since {
            path.push_str(&format!("&since={}", since.to_rfc3339()));
        }
        if let Some(business_id) = &filter.business_id {
            path.push_str(&format!("&business_id={business_id}"));
        }

        let resp = self.request(Method::GET, &path, None).await?;
        let rows = resp
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| resp.as_array().cloned())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn upsert(&self, table: &str, id: &str, record: &Value) -> Result<(), SyncError> {
        self.request(
            Method::PUT,
            &format!("/api/sync/{table}/{id}"),
            Some(record),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), SyncError> {
        self.request(Method::DELETE, &format!("/api/sync/{table}/{id}"), None)
            .await?;
        Ok(())
    }

    async fn submit_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), SyncError> {
        self.rpc(
            "submit_order",
            json!({
                "order": order,
                "items": items,
            }),
        )
        .await
    }

    async fn set_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), SyncError> {
        self.rpc(
            "set_order_status",
            json!({
                "order_id": order_id,
                "status": status.as_str(),
            }),
        )
        .await
    }

    async fn fire_items(&self, order_id: &str, item_ids: &[String]) -> Result<(), SyncError> {
        self.rpc(
            "fire_items",
            json!({
                "order_id": order_id,
                "item_ids": item_ids,
            }),
        )
        .await
    }

    async fn mark_items_ready(
        &self,
        order_id: &str,
        item_ids: &[String],
    ) -> Result<(), SyncError> {
        self.rpc(
            "mark_items_ready",
            json!({
                "order_id": order_id,
                "item_ids": item_ids,
            }),
        )
        .await
    }

    async fn complete_order_part(
        &self,
        order_id: &str,
        item_ids: &[String],
        keep_order_open: bool,
    ) -> Result<(), SyncError> {
        self.rpc(
            "complete_order_part",
            json!({
                "order_id": order_id,
                "item_ids": item_ids,
                "keep_order_open": keep_order_open,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://cloud.example.com/"),
            "https://cloud.example.com"
        );
        assert_eq!(
            normalize_base_url("cloud.example.com/api/"),
            "https://cloud.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_base_url("  https://cloud.example.com/api  "),
            "https://cloud.example.com"
        );
    }

    #[test]
    fn test_status_error_classification() {
        let auth = status_error(StatusCode::UNAUTHORIZED, "");
        assert!(auth.is_auth());

        let forbidden = status_error(StatusCode::FORBIDDEN, "");
        assert!(forbidden.is_auth());

        let validation = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"total mismatch"}"#,
        );
        assert!(matches!(validation, SyncError::Validation(ref m) if m == "total mismatch"));
        assert!(validation.is_permanent());

        let server = status_error(StatusCode::BAD_GATEWAY, "");
        assert!(server.is_transient());

        let backpressure = status_error(StatusCode::TOO_MANY_REQUESTS, "queue is backed up");
        assert!(backpressure.is_backpressure());
    }
}
