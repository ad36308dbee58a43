//! Reconciliation Error Types

use std::time::Duration;
use thiserror::Error;

use super::WorkerState;
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkerError {
    // === Lifecycle Errors ===
    #[error("Reconciliation worker already {0}")]
    AlreadyRunning(WorkerState),

    #[error("Reconciliation worker is not running (state: {0})")]
    NotRunning(WorkerState),

    #[error("Invalid reconciliation config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Reconciliation worker failed to start: {0}")]
    Startup(String),

    #[error("Workers did not drain within {0:?}; aborted")]
    ShutdownTimeout(Duration),

    // === Per-item Errors ===
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Custodian(#[from] ClientError),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::AlreadyRunning(_) => "ALREADY_RUNNING",
            WorkerError::NotRunning(_) => "NOT_RUNNING",
            WorkerError::InvalidConfig(_) => "INVALID_CONFIG",
            WorkerError::Startup(_) => "STARTUP_FAILED",
            WorkerError::ShutdownTimeout(_) => "SHUTDOWN_TIMEOUT",
            WorkerError::Store(_) => "STORE_ERROR",
            WorkerError::Custodian(_) => "CUSTODIAN_ERROR",
        }
    }
}
