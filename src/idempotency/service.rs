use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::key::IdempotencyKey;
use super::store::{
    BeginOutcome, CachedError, IdempotencyRecord, IdempotencyStore, IdempotencyStoreError,
    RecordStatus, StoreStats,
};
use crate::client::redact::{REDACTION_ERROR, redact};
use crate::config::IdempotencyConfig;
use crate::error::OrchestratorError;

/// Code cached when an execution's future is dropped before it finished
pub const ABANDONED_CODE: &str = "ABANDONED";

const WAIT_POLL: Duration = Duration::from_millis(20);

impl From<IdempotencyStoreError> for OrchestratorError {
    fn from(e: IdempotencyStoreError) -> Self {
        OrchestratorError::Store(e.to_string())
    }
}

/// Marks a started record failed if the executing future is dropped
/// mid-flight, so the key does not stay pending until it expires.
struct AbandonGuard {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    request_id: Uuid,
    armed: bool,
}

impl AbandonGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let request_id = self.request_id;
        warn!(key = %key, request_id = %request_id, "Idempotent execution abandoned");
        handle.spawn(async move {
            let error = CachedError {
                code: ABANDONED_CODE.to_string(),
                message: "Execution was cancelled before completion; outcome unknown".to_string(),
            };
            if let Err(e) = store.fail(&key, request_id, error).await {
                error!(key = %key, error = %e, "Failed to record abandoned execution");
            }
        });
    }
}

/// Deduplicates side-effecting custodian operations.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn stats(&self) -> Result<StoreStats, OrchestratorError> {
        Ok(self.store.stats().await?)
    }

    pub async fn get_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, OrchestratorError> {
        Ok(self.store.get(key.as_str()).await?)
    }

    /// Run `op` at most once per live `key`.
    ///
    /// - first caller executes `op` and caches its outcome
    /// - later callers get the cached response, or the cached failure as
    ///   `CachedFailure`, without `op` running again
    /// - callers that arrive while the first is still executing wait up to
    ///   `in_progress_wait` for its outcome, then get `InProgress`
    pub async fn execute_idempotent<Req, Resp, F, Fut>(
        &self,
        key: &IdempotencyKey,
        operation: &str,
        request: &Req,
        op: F,
    ) -> Result<Resp, OrchestratorError>
    where
        Req: Serialize + ?Sized,
        Resp: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resp, OrchestratorError>>,
    {
        let snapshot = request_snapshot(request)?;
        let outcome = self
            .store
            .begin(key.as_str(), operation, snapshot, self.config.ttl)
            .await?;

        match outcome {
            BeginOutcome::Started(record) => self.run(key, operation, record, op).await,
            BeginOutcome::Completed(record) => {
                info!(key = %key, operation, attempts = record.attempts, "Replaying cached response");
                replay(key, &record)
            }
            BeginOutcome::Failed(record) => {
                info!(key = %key, operation, attempts = record.attempts, "Replaying cached failure");
                replay(key, &record)
            }
            BeginOutcome::InProgress(_) => {
                debug!(key = %key, operation, "Duplicate while in progress, waiting for outcome");
                self.wait_for_outcome(key).await
            }
        }
    }

    async fn run<Resp, F, Fut>(
        &self,
        key: &IdempotencyKey,
        operation: &str,
        record: IdempotencyRecord,
        op: F,
    ) -> Result<Resp, OrchestratorError>
    where
        Resp: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resp, OrchestratorError>>,
    {
        let request_id = record.request_id;
        debug!(key = %key, operation, request_id = %request_id, "Executing idempotent operation");

        let guard = AbandonGuard {
            store: self.store.clone(),
            key: key.to_string(),
            request_id,
            armed: true,
        };
        let result = op().await;
        guard.disarm();

        match result {
            Ok(response) => {
                // The side effect happened: a store error here is logged, never
                // returned, so the caller does not retry an executed operation.
                let recorded = match serde_json::to_value(&response) {
                    Ok(value) => self.store.complete(key.as_str(), request_id, value).await,
                    Err(e) => {
                        error!(key = %key, error = %e, "Failed to cache response");
                        let cached = CachedError {
                            code: "SERIALIZATION_ERROR".to_string(),
                            message: format!("Response could not be cached: {}", e),
                        };
                        self.store.fail(key.as_str(), request_id, cached).await
                    }
                };
                if let Err(e) = recorded {
                    error!(
                        key = %key,
                        operation,
                        request_id = %request_id,
                        error = %e,
                        "Operation succeeded but its outcome was not recorded"
                    );
                }
                info!(key = %key, operation, request_id = %request_id, "Idempotent operation completed");
                Ok(response)
            }
            Err(e) => {
                let cached = CachedError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                self.store.fail(key.as_str(), request_id, cached).await?;
                warn!(key = %key, operation, error = %e, "Idempotent operation failed");
                Err(e)
            }
        }
    }

    async fn wait_for_outcome<Resp: DeserializeOwned>(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Resp, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + self.config.in_progress_wait;
        loop {
            match self.store.get(key.as_str()).await? {
                Some(record) if record.status != RecordStatus::Pending => {
                    return replay(key, &record);
                }
                Some(_) => {}
                None => break,
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
        Err(OrchestratorError::InProgress(key.to_string()))
    }

    /// Periodically purge expired records until `shutdown` flips to true.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            info!(sweep_interval_secs = every.as_secs(), "Idempotency sweeper started");
            let mut interval = tokio::time::interval(every);
            // First tick is immediate; nothing can be expired yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match store.purge_expired().await {
                            Ok(0) => debug!("Idempotency sweep found nothing to purge"),
                            Ok(n) => info!(purged = n, "Purged expired idempotency records"),
                            Err(e) => error!(error = %e, "Idempotency sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Idempotency sweeper stopped");
        })
    }
}

fn request_snapshot<Req: Serialize + ?Sized>(request: &Req) -> Result<Value, OrchestratorError> {
    let value = serde_json::to_value(request)?;
    Ok(redact(&value).unwrap_or_else(|_| Value::String(REDACTION_ERROR.to_string())))
}

fn replay<Resp: DeserializeOwned>(
    key: &IdempotencyKey,
    record: &IdempotencyRecord,
) -> Result<Resp, OrchestratorError> {
    match record.status {
        RecordStatus::Completed => {
            let value = record.response.clone().unwrap_or(Value::Null);
            Ok(serde_json::from_value(value)?)
        }
        RecordStatus::Failed => {
            let cached = record.error.clone().unwrap_or(CachedError {
                code: "UNKNOWN".to_string(),
                message: "Failure detail missing".to_string(),
            });
            Err(OrchestratorError::CachedFailure {
                key: key.to_string(),
                code: cached.code,
                message: cached.message,
            })
        }
        RecordStatus::Pending | RecordStatus::Expired => {
            Err(OrchestratorError::InProgress(key.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::MemoryIdempotencyStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(ttl: Duration) -> IdempotencyService {
        IdempotencyService::new(
            Arc::new(MemoryIdempotencyStore::new()),
            IdempotencyConfig {
                ttl,
                sweep_interval: Duration::from_millis(20),
                in_progress_wait: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_completed_result_is_replayed() {
        let svc = service(Duration::from_secs(60));
        let key = IdempotencyKey::derive("submit", &json!({"a": 1})).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let out: String = svc
                .execute_idempotent(&key, "submit", &json!({"a": 1}), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("txid-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(out, "txid-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.stats().await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_failure_is_replayed_not_reexecuted() {
        let svc = service(Duration::from_secs(60));
        let key = IdempotencyKey::from_client("build", "w1", "seq-1");
        let calls = AtomicUsize::new(0);

        let first: Result<String, _> = svc
            .execute_idempotent(&key, "build", &json!({}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::InvalidRequest("bad address".into()))
            })
            .await;
        assert!(matches!(first, Err(OrchestratorError::InvalidRequest(_))));

        let second: Result<String, _> = svc
            .execute_idempotent(&key, "build", &json!({}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await;
        match second {
            Err(OrchestratorError::CachedFailure { code, .. }) => assert_eq!(code, "INVALID_REQUEST"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_execute_once() {
        let svc = Arc::new(service(Duration::from_secs(60)));
        let key = IdempotencyKey::derive("submit", &json!({"tx": "ab"})).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let svc = svc.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                svc.execute_idempotent(&key, "submit", &json!({"tx": "ab"}), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, OrchestratorError>(json!({"transfer": "t-1"}))
                })
                .await
            }));
        }

        for h in handles {
            let out = h.await.unwrap().unwrap();
            assert_eq!(out, json!({"transfer": "t-1"}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_progress_after_wait() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let svc = IdempotencyService::new(
            store.clone(),
            IdempotencyConfig {
                in_progress_wait: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let key = IdempotencyKey::from_client("submit", "w1", "slow");
        store
            .begin(key.as_str(), "submit", json!({}), Duration::from_secs(60))
            .await
            .unwrap();

        let out: Result<String, _> = svc
            .execute_idempotent(&key, "submit", &json!({}), || async { Ok("x".to_string()) })
            .await;
        assert!(matches!(out, Err(OrchestratorError::InProgress(_))));
    }

    #[tokio::test]
    async fn test_reexecutes_after_ttl() {
        let svc = service(Duration::from_millis(40));
        let key = IdempotencyKey::derive("submit", &json!({})).unwrap();
        let calls = AtomicUsize::new(0);

        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OrchestratorError>(1u32)
        };
        svc.execute_idempotent(&key, "submit", &json!({}), run).await.unwrap();
        assert!(svc.get_record(&key).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(svc.get_record(&key).await.unwrap().is_none());

        svc.execute_idempotent(&key, "submit", &json!({}), run).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_is_redacted() {
        let svc = service(Duration::from_secs(60));
        let request = json!({"txHex": "00ff", "otp": "123456"});
        let key = IdempotencyKey::derive("submit", &request).unwrap();
        svc.execute_idempotent(&key, "submit", &request, || async { Ok(true) })
            .await
            .unwrap();

        let record = svc.get_record(&key).await.unwrap().unwrap();
        assert_eq!(record.request["txHex"], "00ff");
        assert_ne!(record.request["otp"], "123456");
    }

    #[tokio::test]
    async fn test_dropped_execution_is_marked_abandoned() {
        let svc = service(Duration::from_secs(60));
        let key = IdempotencyKey::from_client("submit", "w1", "dropped");

        let request = json!({});
        let fut = svc.execute_idempotent(&key, "submit", &request, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1u32)
        });
        let _ = tokio::time::timeout(Duration::from_millis(20), fut).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = svc.get_record(&key).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.unwrap().code, ABANDONED_CODE);
    }

    /// Memory store whose `complete` always fails
    struct CompleteFails(MemoryIdempotencyStore);

    #[async_trait::async_trait]
    impl IdempotencyStore for CompleteFails {
        async fn begin(
            &self,
            key: &str,
            operation: &str,
            request: Value,
            ttl: Duration,
        ) -> Result<BeginOutcome, IdempotencyStoreError> {
            self.0.begin(key, operation, request, ttl).await
        }

        async fn complete(
            &self,
            _key: &str,
            _request_id: Uuid,
            _response: Value,
        ) -> Result<bool, IdempotencyStoreError> {
            Err(IdempotencyStoreError::Backend("write refused".into()))
        }

        async fn fail(
            &self,
            key: &str,
            request_id: Uuid,
            error: CachedError,
        ) -> Result<bool, IdempotencyStoreError> {
            self.0.fail(key, request_id, error).await
        }

        async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
            self.0.get(key).await
        }

        async fn purge_expired(&self) -> Result<usize, IdempotencyStoreError> {
            self.0.purge_expired().await
        }

        async fn stats(&self) -> Result<StoreStats, IdempotencyStoreError> {
            self.0.stats().await
        }
    }

    #[tokio::test]
    async fn test_success_returned_when_outcome_cannot_be_recorded() {
        let svc = IdempotencyService::new(
            Arc::new(CompleteFails(MemoryIdempotencyStore::new())),
            IdempotencyConfig::default(),
        );
        let key = IdempotencyKey::from_client("submit", "w1", "unrecorded");
        let calls = AtomicUsize::new(0);

        let result: u32 = svc
            .execute_idempotent(&key, "submit", &json!({}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let svc = service(Duration::from_millis(5));
        let key = IdempotencyKey::from_client("build", "w", "s");
        svc.execute_idempotent(&key, "build", &json!({}), || async { Ok(1u8) })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = svc.spawn_sweeper(rx);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(svc.stats().await.unwrap().total, 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
