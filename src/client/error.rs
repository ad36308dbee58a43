use std::time::Duration;

use thiserror::Error;

/// Transport failure classes. All of them are retried by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

/// Structured error returned by the custodian API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Upstream HTTP status code
    pub status: u16,
    pub message: String,
    /// Custodian-specific error name, when the body carries one
    pub code: Option<String>,
    pub correlation_id: String,
    /// Parsed `Retry-After` header (429 responses)
    pub retry_after: Option<Duration>,
}

impl ApiError {
    /// 5xx and 429 are worth another attempt; other 4xx are final.
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Transport error ({kind:?}): {message} (correlation_id={correlation_id})")]
    Transport {
        kind: TransportKind,
        message: String,
        correlation_id: String,
    },

    #[error("API error {}: {} (correlation_id={})", .0.status, .0.message, .0.correlation_id)]
    Api(ApiError),

    #[error("Failed to decode response: {message} (correlation_id={correlation_id})")]
    Decode {
        message: String,
        correlation_id: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { .. } => true,
            ClientError::Api(api) => api.is_retryable(),
            ClientError::Decode { .. } | ClientError::InvalidRequest(_) => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }

    /// Upstream status code, if the custodian answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api(api) => Some(api.status),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ClientError::Transport { correlation_id, .. }
            | ClientError::Decode { correlation_id, .. } => Some(correlation_id),
            ClientError::Api(api) => Some(&api.correlation_id),
            ClientError::InvalidRequest(_) => None,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, correlation_id: &str) -> Self {
        if e.is_builder() {
            return ClientError::InvalidRequest(e.to_string());
        }
        let kind = if e.is_timeout() {
            TransportKind::Timeout
        } else if e.is_connect() {
            TransportKind::Connect
        } else {
            TransportKind::Other
        };
        ClientError::Transport {
            kind,
            message: e.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> ClientError {
        ClientError::Api(ApiError {
            status,
            message: "x".into(),
            code: None,
            correlation_id: "cid".into(),
            retry_after: None,
        })
    }

    #[test]
    fn test_retryable_classes() {
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
        assert!(api(429).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(!api(409).is_retryable());

        let transport = ClientError::Transport {
            kind: TransportKind::Connect,
            message: "refused".into(),
            correlation_id: "cid".into(),
        };
        assert!(transport.is_retryable());
        assert!(transport.is_transport());
        assert_eq!(transport.status(), None);
    }

    #[test]
    fn test_display_carries_correlation_id() {
        let err = api(502);
        assert_eq!(err.correlation_id(), Some("cid"));
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("cid"));
    }
}
