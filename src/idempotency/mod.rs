//! Idempotency Service
//!
//! Wraps the two custodian-mutating calls (build and submit) so that network
//! retries and duplicate client requests never execute them twice.

pub mod key;
pub mod service;
pub mod store;

pub use key::IdempotencyKey;
pub use service::{ABANDONED_CODE, IdempotencyService};
pub use store::{
    BeginOutcome, CachedError, IdempotencyRecord, IdempotencyStore, IdempotencyStoreError,
    MemoryIdempotencyStore, RecordStatus, StoreStats,
};
