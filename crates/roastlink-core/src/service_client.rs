//! HTTP client for the roastery backend's measurement endpoints.
//!
//! [`HttpMeasurementApi`] implements [`MeasurementApi`] over the REST API:
//!
//! - `POST {base}/api/measurements` with an `Idempotency-Key` header set to
//!   the measurement's client id
//! - `GET {base}/api/measurements?limit=N`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roastlink_core::{HttpMeasurementApi, MemoryQueue, PersistenceGateway};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = HttpMeasurementApi::new("https://roastery.example.com")?
//!     .with_token("secret-token");
//! let gateway = PersistenceGateway::new(Arc::new(api), Arc::new(MemoryQueue::new()));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::persistence::{ApiError, MeasurementApi, MeasurementPayload, RemoteMeasurement};

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the measurement backend.
#[derive(Clone)]
pub struct HttpMeasurementApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for HttpMeasurementApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMeasurementApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn normalize_url(base_url: &str) -> Result<String, ApiError> {
    let base_url = base_url.trim().trim_end_matches('/').to_string();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ApiError::InvalidUrl(format!(
            "URL must start with http:// or https://, got: {}",
            base_url
        )));
    }
    Ok(base_url)
}

impl HttpMeasurementApi {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base_url = normalize_url(base_url)?;
        let client = Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self, ApiError> {
        Ok(Self {
            client,
            base_url: normalize_url(base_url)?,
            token: None,
        })
    }

    /// Authenticate requests with a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn measurements_url(&self) -> String {
        format!("{}/api/measurements", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<reqwest::Response, ApiError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(format!("{url}: {e}")))
    }

    async fn error_for(response: reqwest::Response) -> ApiError {
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return ApiError::Duplicate;
        }
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string());

        ApiError::Status {
            status: status.as_u16(),
            message,
        }
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MeasurementApi for HttpMeasurementApi {
    async fn submit(&self, payload: &MeasurementPayload) -> Result<Option<String>, ApiError> {
        let url = self.measurements_url();
        let request = self
            .client
            .post(&url)
            .header("Idempotency-Key", payload.client_id.to_string())
            .json(payload);
        let response = self.send(request, &url).await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        // An empty or non-JSON body is still a success.
        let body = response.json::<serde_json::Value>().await.ok();
        Ok(body.and_then(|v| match v.get("id") {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RemoteMeasurement>, ApiError> {
        let url = self.measurements_url();
        let request = self.client.get(&url).query(&[("limit", limit)]);
        let response = self.send(request, &url).await?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = HttpMeasurementApi::new("http://localhost:8080").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(
            client.measurements_url(),
            "http://localhost:8080/api/measurements"
        );
    }

    #[test]
    fn test_client_normalizes_url() {
        let client = HttpMeasurementApi::new(" https://roastery.example.com/ ").unwrap();
        assert_eq!(client.base_url(), "https://roastery.example.com");
    }

    #[test]
    fn test_client_invalid_url() {
        assert!(matches!(
            HttpMeasurementApi::new("roastery.example.com"),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = HttpMeasurementApi::new("http://localhost:8080")
            .unwrap()
            .with_token("very-secret");
        let debug = format!("{client:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        // Port 9 (discard) on localhost is not expected to run an HTTP server.
        let client = HttpMeasurementApi::new("http://127.0.0.1:9").unwrap();
        let err = client.recent(5).await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
