//! Orchestrator Error Types
//!
//! Errors surfaced to request-handling collaborators. Codes are stable so
//! handlers can map them onto API responses without matching on messages.

use thiserror::Error;

use crate::client::ClientError;

/// Orchestrator error types
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    // === Upstream Errors ===
    #[error("Custodian unreachable: {message} (correlation_id={correlation_id})")]
    Transport {
        message: String,
        correlation_id: String,
    },

    #[error("Custodian API error {status}: {message} (correlation_id={correlation_id})")]
    Upstream {
        status: u16,
        message: String,
        correlation_id: String,
    },

    // === Idempotency Errors ===
    #[error("Operation already in progress for key {0}")]
    InProgress(String),

    #[error("Replayed failure for key {key}: [{code}] {message}")]
    CachedFailure {
        key: String,
        code: String,
        message: String,
    },

    // === Validation Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === System Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Transport { .. } => "CUSTODIAN_UNREACHABLE",
            OrchestratorError::Upstream { .. } => "CUSTODIAN_ERROR",
            OrchestratorError::InProgress(_) => "IN_PROGRESS",
            OrchestratorError::CachedFailure { .. } => "CACHED_FAILURE",
            OrchestratorError::InvalidRequest(_) => "INVALID_REQUEST",
            OrchestratorError::NotFound(_) => "NOT_FOUND",
            OrchestratorError::Store(_) => "STORE_ERROR",
            OrchestratorError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::InvalidRequest(_) => 400,
            OrchestratorError::NotFound(_) => 404,
            OrchestratorError::InProgress(_) => 409,
            OrchestratorError::CachedFailure { .. } => 422,
            // Upstream 4xx are the caller's problem, everything else is ours.
            OrchestratorError::Upstream { status, .. } if (400..500).contains(status) => 422,
            OrchestratorError::Upstream { .. } | OrchestratorError::Transport { .. } => 502,
            OrchestratorError::Store(_) | OrchestratorError::Serialization(_) => 500,
        }
    }

    /// True when the caller should retry later with the same request.
    pub fn is_retry_later(&self) -> bool {
        match self {
            OrchestratorError::InProgress(_) | OrchestratorError::Transport { .. } => true,
            OrchestratorError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<ClientError> for OrchestratorError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Transport {
                message,
                correlation_id,
                ..
            } => OrchestratorError::Transport {
                message,
                correlation_id,
            },
            ClientError::Api(api) => OrchestratorError::Upstream {
                status: api.status,
                message: api.message,
                correlation_id: api.correlation_id,
            },
            ClientError::Decode { message, .. } => OrchestratorError::Serialization(message),
            ClientError::InvalidRequest(message) => OrchestratorError::InvalidRequest(message),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiError, TransportKind};

    #[test]
    fn test_error_codes() {
        assert_eq!(OrchestratorError::InProgress("k".into()).code(), "IN_PROGRESS");
        assert_eq!(
            OrchestratorError::NotFound("wallet".into()).code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(OrchestratorError::InProgress("k".into()).http_status(), 409);
        assert_eq!(
            OrchestratorError::InvalidRequest("bad".into()).http_status(),
            400
        );
        let upstream_4xx = OrchestratorError::Upstream {
            status: 400,
            message: "invalid address".into(),
            correlation_id: "c".into(),
        };
        assert_eq!(upstream_4xx.http_status(), 422);
        let upstream_5xx = OrchestratorError::Upstream {
            status: 503,
            message: "down".into(),
            correlation_id: "c".into(),
        };
        assert_eq!(upstream_5xx.http_status(), 502);
    }

    #[test]
    fn test_retry_later() {
        assert!(OrchestratorError::InProgress("k".into()).is_retry_later());
        assert!(
            !OrchestratorError::CachedFailure {
                key: "k".into(),
                code: "CUSTODIAN_ERROR".into(),
                message: "x".into()
            }
            .is_retry_later()
        );
    }

    #[test]
    fn test_from_client_error_keeps_correlation_id() {
        let err: OrchestratorError = ClientError::Api(ApiError {
            status: 429,
            message: "slow down".into(),
            code: None,
            correlation_id: "abc".into(),
            retry_after: None,
        })
        .into();
        match err {
            OrchestratorError::Upstream {
                status,
                correlation_id,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(correlation_id, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err: OrchestratorError = ClientError::Transport {
            kind: TransportKind::Timeout,
            message: "timed out".into(),
            correlation_id: "xyz".into(),
        }
        .into();
        assert!(err.is_retry_later());
    }
}
