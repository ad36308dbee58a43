//! Persistence collaborator
//!
//! The core reads and writes transfer records through [`TransferStore`];
//! the schema itself belongs to the service that embeds the core. The
//! in-memory implementation backs the binary and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::canonical::{CanonicalStatus, WalletClass};
use crate::error::OrchestratorError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Invariant violated for transfer {id}: {reason}")]
    Invariant { id: String, reason: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TransferNotFound(_) | StoreError::WalletNotFound(_) => {
                OrchestratorError::NotFound(e.to_string())
            }
            _ => OrchestratorError::Store(e.to_string()),
        }
    }
}

/// A transfer request as persisted by the embedding service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub wallet_id: String,
    pub recipient: String,
    /// Base units, decimal string
    pub amount: String,
    pub coin: String,
    pub transfer_class: WalletClass,
    pub status: CanonicalStatus,
    /// Assigned by the custodian on submit
    pub custodian_transfer_id: Option<String>,
    pub tx_hash: Option<String>,
    pub required_approvals: u32,
    pub received_approvals: u32,
    pub fee: Option<String>,
    pub fee_rate: Option<String>,
    pub initiated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Set the first time a stale escalation is raised
    pub stale_notified_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn new(
        id: impl Into<String>,
        wallet_id: impl Into<String>,
        coin: impl Into<String>,
        recipient: impl Into<String>,
        amount: impl Into<String>,
        transfer_class: WalletClass,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            wallet_id: wallet_id.into(),
            recipient: recipient.into(),
            amount: amount.into(),
            coin: coin.into(),
            transfer_class,
            status: CanonicalStatus::Building,
            custodian_transfer_id: None,
            tx_hash: None,
            required_approvals: 0,
            received_approvals: 0,
            fee: None,
            fee_rate: None,
            initiated_by: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            approved_at: None,
            completed_at: None,
            failed_at: None,
            stale_notified_at: None,
        }
    }

    /// Move to `next`, stamping lifecycle timestamps on first arrival.
    ///
    /// Timestamps are set-once: a populated one is never overwritten.
    /// Returns false (and changes nothing) if the move is not allowed.
    pub fn apply_status(&mut self, next: CanonicalStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = now;

        if previous == CanonicalStatus::WaitingApproval && !next.is_failure() {
            self.approved_at.get_or_insert(now);
        }
        if matches!(
            next,
            CanonicalStatus::WaitingApproval | CanonicalStatus::Broadcast | CanonicalStatus::Pending
        ) {
            self.submitted_at.get_or_insert(now);
        }
        match next {
            CanonicalStatus::Confirmed => {
                self.completed_at.get_or_insert(now);
            }
            s if s.is_failure() => {
                self.failed_at.get_or_insert(now);
            }
            _ => {}
        }
        true
    }

    /// Record approval progress, keeping `received <= required`.
    pub fn set_approvals(&mut self, received: u32, required: u32) {
        self.required_approvals = required;
        self.received_approvals = received.min(required);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: String,
    pub custodian_wallet_id: String,
    pub coin: String,
    pub label: Option<String>,
    /// Raw custodian wallet type, e.g. `hot` or `cold`
    pub wallet_type: String,
}

impl WalletRecord {
    pub fn class(&self) -> WalletClass {
        WalletClass::from_wallet_type(&self.wallet_type)
    }
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn get_transfer(&self, id: &str) -> Result<TransferRecord, StoreError>;

    /// Up to `limit` transfers whose status is one of `statuses`, oldest first
    async fn list_transfers_by_status(
        &self,
        statuses: &[CanonicalStatus],
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Replace the stored record. Atomic per record.
    async fn update_transfer(&self, record: &TransferRecord) -> Result<(), StoreError>;

    async fn get_wallet(&self, id: &str) -> Result<WalletRecord, StoreError>;
}

#[derive(Default)]
pub struct MemoryTransferStore {
    transfers: DashMap<String, TransferRecord>,
    wallets: DashMap<String, WalletRecord>,
    writes: AtomicU64,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transfer(&self, record: TransferRecord) {
        self.transfers.insert(record.id.clone(), record);
    }

    pub fn insert_wallet(&self, wallet: WalletRecord) {
        self.wallets.insert(wallet.id.clone(), wallet);
    }

    /// Number of `update_transfer` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn get_transfer(&self, id: &str) -> Result<TransferRecord, StoreError> {
        self.transfers
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::TransferNotFound(id.to_string()))
    }

    async fn list_transfers_by_status(
        &self,
        statuses: &[CanonicalStatus],
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let mut matching: Vec<TransferRecord> = self
            .transfers
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .map(|r| r.clone())
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn update_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        if record.received_approvals > record.required_approvals {
            return Err(StoreError::Invariant {
                id: record.id.clone(),
                reason: format!(
                    "received_approvals {} > required_approvals {}",
                    record.received_approvals, record.required_approvals
                ),
            });
        }
        let Some(mut slot) = self.transfers.get_mut(&record.id) else {
            return Err(StoreError::TransferNotFound(record.id.clone()));
        };
        *slot = record.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_wallet(&self, id: &str) -> Result<WalletRecord, StoreError> {
        self.wallets
            .get(id)
            .map(|w| w.clone())
            .ok_or_else(|| StoreError::WalletNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransferRecord {
        TransferRecord::new("t1", "w1", "btc", "bc1q", "1000", WalletClass::Warm)
    }

    #[test]
    fn test_terminal_timestamps_are_set_once() {
        let mut r = record();
        let t1 = Utc::now();
        assert!(r.apply_status(CanonicalStatus::Broadcast, t1));
        assert_eq!(r.submitted_at, Some(t1));
        assert!(r.apply_status(CanonicalStatus::Confirmed, t1));
        assert_eq!(r.completed_at, Some(t1));

        let t2 = t1 + chrono::Duration::hours(1);
        assert!(!r.apply_status(CanonicalStatus::Failed, t2));
        assert_eq!(r.completed_at, Some(t1));
        assert_eq!(r.failed_at, None);
    }

    #[test]
    fn test_regression_is_refused() {
        let mut r = record();
        let now = Utc::now();
        assert!(r.apply_status(CanonicalStatus::Broadcast, now));
        assert!(!r.apply_status(CanonicalStatus::Building, now));
        assert!(!r.apply_status(CanonicalStatus::Unknown, now));
        assert_eq!(r.status, CanonicalStatus::Broadcast);
    }

    #[test]
    fn test_leaving_approval_sets_approved_at() {
        let mut r = record();
        let now = Utc::now();
        r.apply_status(CanonicalStatus::WaitingApproval, now);
        assert_eq!(r.approved_at, None);
        r.apply_status(CanonicalStatus::Broadcast, now);
        assert_eq!(r.approved_at, Some(now));
    }

    #[test]
    fn test_rejection_is_not_approval() {
        let mut r = record();
        let now = Utc::now();
        r.apply_status(CanonicalStatus::WaitingApproval, now);
        r.apply_status(CanonicalStatus::Rejected, now);
        assert_eq!(r.approved_at, None);
        assert_eq!(r.failed_at, Some(now));
    }

    #[test]
    fn test_set_approvals_clamps() {
        let mut r = record();
        r.set_approvals(5, 2);
        assert_eq!(r.received_approvals, 2);
        assert_eq!(r.required_approvals, 2);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryTransferStore::new();
        let mut r = record();
        store.insert_transfer(r.clone());

        r.apply_status(CanonicalStatus::Signing, Utc::now());
        store.update_transfer(&r).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(
            store.get_transfer("t1").await.unwrap().status,
            CanonicalStatus::Signing
        );

        let listed = store
            .list_transfers_by_status(&[CanonicalStatus::Signing], 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(
            store
                .list_transfers_by_status(&[CanonicalStatus::Confirmed], 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_store_rejects_approval_overflow() {
        let store = MemoryTransferStore::new();
        let mut r = record();
        store.insert_transfer(r.clone());
        r.required_approvals = 1;
        r.received_approvals = 3;
        assert!(matches!(
            store.update_transfer(&r).await,
            Err(StoreError::Invariant { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_respects_limit() {
        let store = MemoryTransferStore::new();
        for i in 0..5 {
            store.insert_transfer(TransferRecord::new(
                format!("t{i}"),
                "w1",
                "btc",
                "a",
                "1",
                WalletClass::Cold,
            ));
        }
        let listed = store
            .list_transfers_by_status(&[CanonicalStatus::Building], 3)
            .await
            .unwrap();
        assert_eq!(listed.len(), 3);
        assert!(matches!(
            store.get_wallet("nope").await,
            Err(StoreError::WalletNotFound(_))
        ));
    }
}
