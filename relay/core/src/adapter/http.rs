//! HTTP JSON Adapter
//!
//! Reaches a provider that speaks a minimal JSON protocol:
//!
//! - `POST {endpoint}/invoke` with body `{"method": ..., "params": ...}`;
//!   a 2xx response body is the result value
//! - `GET {endpoint}{health_check_path}`; any 2xx means alive
//!
//! HTTP statuses are mapped onto [`AdapterError`] so the classifier sees the
//! same shape regardless of transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{AdapterError, ServerAdapter};

/// Upper bound for any single HTTP exchange; per-call timeouts are shorter
const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Adapter for providers exposing the JSON invoke endpoint
pub struct HttpJsonAdapter {
    id: String,
    endpoint: String,
    health_check_path: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpJsonAdapter {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        health_check_path: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            id: id.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            health_check_path: health_check_path.into(),
            bearer_token: None,
            client,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn invoke_url(&self) -> String {
        format!("{}/invoke", self.endpoint)
    }

    fn health_url(&self) -> String {
        if self.health_check_path.starts_with('/') {
            format!("{}{}", self.endpoint, self.health_check_path)
        } else {
            format!("{}/{}", self.endpoint, self.health_check_path)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl std::fmt::Debug for HttpJsonAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonAdapter")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("health_check_path", &self.health_check_path)
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

#[async_trait]
impl ServerAdapter for HttpJsonAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, AdapterError> {
        let request = self
            .authorize(self.client.post(self.invoke_url()))
            .timeout(timeout)
            .json(&json!({ "method": method, "params": params }));

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| map_transport_error(&e, timeout))
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let response = self
            .authorize(self.client.get(self.health_url()))
            .send()
            .await
            .map_err(|e| map_transport_error(&e, CLIENT_TIMEOUT))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let retry_after = parse_retry_after(response.headers());
            Err(map_status(status, retry_after, String::new()))
        }
    }
}

/// Map a non-success HTTP status onto an adapter error
pub(crate) fn map_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> AdapterError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::AuthenticationFailed(message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            AdapterError::InvalidRequest(message)
        }
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            AdapterError::Timeout(Duration::ZERO)
        }
        s if s.is_server_error() => AdapterError::ServerFault {
            status: Some(s.as_u16()),
            message,
        },
        s => AdapterError::Other(format!("Unexpected status {s}: {message}")),
    }
}

fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        AdapterError::ConnectionFailed(err.to_string())
    } else if err.is_decode() {
        AdapterError::ServerFault {
            status: None,
            message: format!("Malformed response body: {err}"),
        }
    } else {
        AdapterError::Other(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, None, String::new()),
            AdapterError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, None, String::new()),
            AdapterError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad sql".into()),
            AdapterError::InvalidRequest(m) if m == "bad sql"
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), String::new()),
            AdapterError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, None, String::new()),
            AdapterError::ServerFault { status: Some(503), .. }
        ));
        assert!(matches!(
            map_status(StatusCode::IM_A_TEAPOT, None, String::new()),
            AdapterError::Other(_)
        ));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_urls() {
        let adapter = HttpJsonAdapter::new("s", "http://localhost:8080/", "healthz").unwrap();
        assert_eq!(adapter.invoke_url(), "http://localhost:8080/invoke");
        assert_eq!(adapter.health_url(), "http://localhost:8080/healthz");

        let adapter = HttpJsonAdapter::new("s", "http://localhost:8080", "/health").unwrap();
        assert_eq!(adapter.health_url(), "http://localhost:8080/health");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_failure() {
        // Port 9 (discard) on localhost is not expected to accept HTTP
        let adapter = HttpJsonAdapter::new("s", "http://127.0.0.1:9", "/health").unwrap();
        let err = adapter
            .call("ping", &Value::Null, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::ConnectionFailed(_) | AdapterError::Timeout(_)
        ));
    }
}
