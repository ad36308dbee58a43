//! Idempotency record storage.
//!
//! The store owns check-and-create: `begin` must decide "execute" or
//! "replay" for a key atomically, otherwise two callers can both see the key
//! absent and both run the side effect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
            RecordStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure outcome cached for replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Identifies one execution of the key; a restart after expiry gets a new one
    pub request_id: Uuid,
    pub operation: String,
    pub status: RecordStatus,
    /// Redacted request snapshot
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<CachedError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Invocations observed for this key, first execution included
    pub attempts: u32,
}

impl IdempotencyRecord {
    fn new(key: &str, operation: &str, request: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.to_string(),
            request_id: Uuid::new_v4(),
            operation: operation.to_string(),
            status: RecordStatus::Pending,
            request,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            attempts: 1,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Expired || now > self.expires_at
    }
}

/// What `begin` decided for a key
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// New (or restarted) record; the caller must execute and then
    /// `complete` or `fail` with this record's `request_id`.
    Started(IdempotencyRecord),
    Completed(IdempotencyRecord),
    Failed(IdempotencyRecord),
    /// Another caller is executing this key right now
    InProgress(IdempotencyRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    /// Sum of `attempts` across live records
    pub attempts: u64,
}

#[derive(Error, Debug, Clone)]
pub enum IdempotencyStoreError {
    #[error("Idempotency backend error: {0}")]
    Backend(String),
}

/// Storage for idempotency records.
///
/// The in-memory implementation only dedupes within one process; running the
/// core as several processes needs a shared backend behind this trait.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically look up `key` and create a pending record when it is
    /// absent or expired. Non-starting outcomes count as an attempt.
    async fn begin(
        &self,
        key: &str,
        operation: &str,
        request: Value,
        ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError>;

    /// Mark the execution `request_id` completed. Returns false if the record
    /// is gone or now belongs to another execution.
    async fn complete(
        &self,
        key: &str,
        request_id: Uuid,
        response: Value,
    ) -> Result<bool, IdempotencyStoreError>;

    async fn fail(
        &self,
        key: &str,
        request_id: Uuid,
        error: CachedError,
    ) -> Result<bool, IdempotencyStoreError>;

    /// Live record for `key`. Expired records are never returned.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

    /// Remove every record past its expiry. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, IdempotencyStoreError>;

    async fn stats(&self) -> Result<StoreStats, IdempotencyStoreError>;
}

/// In-process store on a sharded map; each key's check-and-create runs under
/// its shard's write lock via the entry API.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn finish(
        &self,
        key: &str,
        request_id: Uuid,
        apply: impl FnOnce(&mut IdempotencyRecord),
    ) -> bool {
        let Some(mut record) = self.records.get_mut(key) else {
            return false;
        };
        if record.request_id != request_id || record.status != RecordStatus::Pending {
            return false;
        }
        apply(&mut record);
        record.updated_at = Utc::now();
        true
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &str,
        operation: &str,
        request: Value,
        ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError> {
        let now = Utc::now();
        let outcome = match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let record = IdempotencyRecord::new(key, operation, request, ttl, now);
                slot.insert(record.clone());
                BeginOutcome::Started(record)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.is_expired(now) {
                    *record = IdempotencyRecord::new(key, operation, request, ttl, now);
                    BeginOutcome::Started(record.clone())
                } else {
                    record.attempts = record.attempts.saturating_add(1);
                    record.updated_at = now;
                    match record.status {
                        RecordStatus::Completed => BeginOutcome::Completed(record.clone()),
                        RecordStatus::Failed => BeginOutcome::Failed(record.clone()),
                        // is_expired() already covers Expired
                        RecordStatus::Pending | RecordStatus::Expired => {
                            BeginOutcome::InProgress(record.clone())
                        }
                    }
                }
            }
        };
        Ok(outcome)
    }

    async fn complete(
        &self,
        key: &str,
        request_id: Uuid,
        response: Value,
    ) -> Result<bool, IdempotencyStoreError> {
        Ok(self.finish(key, request_id, |record| {
            record.status = RecordStatus::Completed;
            record.response = Some(response);
        }))
    }

    async fn fail(
        &self,
        key: &str,
        request_id: Uuid,
        error: CachedError,
    ) -> Result<bool, IdempotencyStoreError> {
        Ok(self.finish(key, request_id, |record| {
            record.status = RecordStatus::Failed;
            record.error = Some(error);
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let now = Utc::now();
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(None);
        };
        if record.is_expired(now) {
            record.status = RecordStatus::Expired;
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn purge_expired(&self) -> Result<usize, IdempotencyStoreError> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()))
    }

    async fn stats(&self) -> Result<StoreStats, IdempotencyStoreError> {
        let now = Utc::now();
        let mut stats = StoreStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            if record.is_expired(now) {
                stats.expired += 1;
                continue;
            }
            stats.attempts += u64::from(record.attempts);
            match record.status {
                RecordStatus::Pending => stats.pending += 1,
                RecordStatus::Completed => stats.completed += 1,
                RecordStatus::Failed => stats.failed += 1,
                RecordStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_begin_then_replay() {
        let store = MemoryIdempotencyStore::new();
        let BeginOutcome::Started(record) = store.begin("k1", "submit", json!({}), TTL).await.unwrap()
        else {
            panic!("expected start");
        };
        assert_eq!(record.status, RecordStatus::Pending);

        assert!(matches!(
            store.begin("k1", "submit", json!({}), TTL).await.unwrap(),
            BeginOutcome::InProgress(_)
        ));

        assert!(
            store
                .complete("k1", record.request_id, json!({"txid": "ab"}))
                .await
                .unwrap()
        );
        match store.begin("k1", "submit", json!({}), TTL).await.unwrap() {
            BeginOutcome::Completed(r) => {
                assert_eq!(r.response, Some(json!({"txid": "ab"})));
                assert_eq!(r.attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_is_cached() {
        let store = MemoryIdempotencyStore::new();
        let BeginOutcome::Started(record) = store.begin("k", "build", json!({}), TTL).await.unwrap()
        else {
            panic!("expected start");
        };
        let err = CachedError {
            code: "CUSTODIAN_ERROR".into(),
            message: "invalid address".into(),
        };
        assert!(store.fail("k", record.request_id, err.clone()).await.unwrap());
        match store.begin("k", "build", json!({}), TTL).await.unwrap() {
            BeginOutcome::Failed(r) => assert_eq!(r.error, Some(err)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_execution_cannot_finish_new_record() {
        let store = MemoryIdempotencyStore::new();
        store.begin("k", "submit", json!({}), TTL).await.unwrap();
        assert!(!store.complete("k", Uuid::new_v4(), json!(1)).await.unwrap());
        assert!(!store.complete("missing", Uuid::new_v4(), json!(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_is_absent_and_restartable() {
        let store = MemoryIdempotencyStore::new();
        let ttl = Duration::from_millis(30);
        let BeginOutcome::Started(first) = store.begin("k", "submit", json!({}), ttl).await.unwrap()
        else {
            panic!("expected start");
        };
        store.complete("k", first.request_id, json!("ok")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().expired, 1);

        match store.begin("k", "submit", json!({}), ttl).await.unwrap() {
            BeginOutcome::Started(second) => assert_ne!(second.request_id, first.request_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryIdempotencyStore::new();
        store
            .begin("short", "submit", json!({}), Duration::from_millis(10))
            .await
            .unwrap();
        store.begin("long", "submit", json!({}), TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_begin_starts_once() {
        let store = std::sync::Arc::new(MemoryIdempotencyStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.begin("race", "submit", json!({}), TTL).await.unwrap()
            }));
        }
        let mut started = 0;
        for h in handles {
            if matches!(h.await.unwrap(), BeginOutcome::Started(_)) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(store.stats().await.unwrap().attempts, 32);
    }
}
