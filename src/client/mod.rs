//! Resilient Remote Client
//!
//! HTTP calls to the custodian with a per-call timeout, bounded retry with
//! exponential backoff, a correlation id per logical call, and redacted
//! request/response logging.
//!
//! Retried: 5xx, 429 and transport failures (connect, timeout).
//! Never retried: other 4xx, decode failures, malformed requests.

pub mod error;
pub mod redact;
pub mod retry;

pub use error::{ApiError, ClientError, TransportKind};
pub use retry::RetryPolicy;

use std::time::Duration;

use reqwest::Method;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CustodianConfig;

/// Outbound header carrying the correlation id
pub const CORRELATION_HEADER: &str = "X-Request-ID";

/// Remote client for the custodian HTTP API
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| redact::REDACTED))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RemoteClient {
    /// Create a new client from custodian configuration
    pub fn new(config: &CustodianConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            timeout: config.timeout,
            retry: config.retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute a call with the default timeout
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        self.call_with_timeout(method, path, body, self.timeout)
            .await
    }

    /// Execute a call with a caller-supplied per-attempt timeout
    pub async fn call_with_timeout(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        self.call_correlated(method, path, body, timeout, &correlation_id)
            .await
    }

    /// Every attempt of one logical call carries `correlation_id`
    async fn call_correlated(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
        correlation_id: &str,
    ) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            match self
                .send_once(&method, &url, body, timeout, correlation_id, attempt)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let retry_after = match &e {
                        ClientError::Api(api) => api.retry_after,
                        _ => None,
                    };
                    let delay = self.retry.delay_for(attempt, retry_after);
                    warn!(
                        correlation_id = correlation_id,
                        method = %method,
                        path = path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Custodian call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        correlation_id = correlation_id,
                        method = %method,
                        path = path,
                        attempts = attempt + 1,
                        error = %e,
                        "Custodian call failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
        correlation_id: &str,
        attempt: u32,
    ) -> Result<Value, ClientError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(timeout)
            .header(CORRELATION_HEADER, correlation_id);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(
            correlation_id = correlation_id,
            method = %method,
            url = url,
            attempt = attempt,
            body = %body.map(redact::redact_for_log).unwrap_or_default(),
            "Custodian request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, correlation_id))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::from_reqwest(e, correlation_id))?;

        debug!(
            correlation_id = correlation_id,
            status = status.as_u16(),
            body = %redact::redact_bytes_for_log(&bytes),
            "Custodian response"
        );

        if status.is_success() {
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
                message: e.to_string(),
                correlation_id: correlation_id.to_string(),
            });
        }

        let (message, code) = extract_error(&bytes, status);
        Err(ClientError::Api(ApiError {
            status: status.as_u16(),
            message,
            code,
            correlation_id: correlation_id.to_string(),
            retry_after,
        }))
    }

    /// GET and decode into `T`
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let value = self
            .call_correlated(Method::GET, path, None, self.timeout, &correlation_id)
            .await?;
        decode(value, &correlation_id)
    }

    /// POST a serializable body and decode the reply into `T`
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        let correlation_id = Uuid::new_v4().to_string();
        let value = self
            .call_correlated(Method::POST, path, Some(&body), self.timeout, &correlation_id)
            .await?;
        decode(value, &correlation_id)
    }
}

fn decode<T: DeserializeOwned>(value: Value, correlation_id: &str) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Decode {
        message: e.to_string(),
        correlation_id: correlation_id.to_string(),
    })
}

/// Pull a message and error name out of a custodian error body.
fn extract_error(bytes: &[u8], status: reqwest::StatusCode) -> (String, Option<String>) {
    let fallback = status
        .canonical_reason()
        .unwrap_or("upstream error")
        .to_string();

    let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(bytes) else {
        return (fallback, None);
    };

    let message = ["error", "message"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or(fallback);
    let code = ["name", "code"]
        .iter()
        .find_map(|k| body.get(*k))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    (message, code)
}
