//! Custody Orchestrator - Transfer Orchestration Core
//!
//! Sits between request handlers and an external custodian. Every call that
//! moves funds is idempotent, every custodian state is mapped onto one
//! canonical lifecycle, and a background worker keeps local records in step
//! with the custodian.
//!
//! # Modules
//!
//! - [`client`] - Custodian HTTP client (retry, correlation ids, redaction)
//! - [`custodian`] - Custodian API surface and wire types
//! - [`idempotency`] - At-most-once execution of state-changing calls
//! - [`canonical`] - Status mapping, risk, approvals and SLA policy
//! - [`store`] - Transfer/wallet persistence seam
//! - [`reconcile`] - Background reconciliation worker
//! - [`notify`] - Asynchronous notification dispatch
//! - [`orchestrator`] - Build/submit entry points

// Ambient
pub mod config;
pub mod error;
pub mod logging;

// Custodian access
pub mod client;
pub mod custodian;

// Core
pub mod canonical;
pub mod idempotency;
pub mod notify;
pub mod orchestrator;
pub mod reconcile;
pub mod store;

/// Short commit hash captured at build time
pub const GIT_HASH: &str = env!("GIT_HASH");

// Convenient re-exports at crate root
pub use canonical::{CanonicalStatus, RiskLevel, SlaProfile, StatusCanonicalizer, WalletClass};
pub use client::{ClientError, RemoteClient, RetryPolicy};
pub use config::{AppConfig, ConfigError};
pub use custodian::{CustodianApi, HttpCustodian};
pub use error::OrchestratorError;
pub use idempotency::{IdempotencyKey, IdempotencyService, MemoryIdempotencyStore};
pub use notify::{Notification, NotificationDispatcher};
pub use orchestrator::{BuildOutcome, SubmitOutcome, TransferOrchestrator};
pub use reconcile::{ReconciliationWorker, WorkerError, WorkerState};
pub use store::{MemoryTransferStore, TransferRecord, TransferStore};
