//! Notification Dispatcher
//!
//! Bounded queue drained by a fixed pool of workers. Producers never wait:
//! a full queue drops the notification with an error log.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{DeliveryError, NotificationChannel};
use super::types::{ChannelKind, DeliveryStatus, Notification};
use crate::config::NotificationConfig;

/// Failed and dropped notifications kept for inspection; oldest evicted first
pub const FAILURE_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

struct Inner {
    config: NotificationConfig,
    tx: mpsc::Sender<Notification>,
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
    /// Registration order; used when a notification names no channels
    default_channels: Vec<ChannelKind>,
    /// Notifications still queued or awaiting a retry
    log: DashMap<Uuid, Notification>,
    failures: std::sync::Mutex<VecDeque<Notification>>,
    counters: Counters,
    shutdown: watch::Receiver<bool>,
}

pub struct NotificationDispatcher {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Create the dispatcher and spawn its worker pool.
    pub fn start(config: NotificationConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let default_channels: Vec<ChannelKind> = channels.iter().map(|c| c.kind()).collect();
        let channels = channels.into_iter().map(|c| (c.kind(), c)).collect();
        let worker_count = config.worker_count.max(1);

        let inner = Arc::new(Inner {
            config,
            tx,
            channels,
            default_channels,
            log: DashMap::new(),
            failures: std::sync::Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            shutdown: shutdown_rx,
        });

        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..worker_count)
            .map(|id| tokio::spawn(run_worker(id, inner.clone(), rx.clone())))
            .collect();

        info!(
            workers = worker_count,
            queue_size = inner.config.queue_size,
            channels = ?inner.default_channels,
            "Notification dispatcher started"
        );

        Self {
            inner,
            shutdown_tx,
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Queue a notification for delivery. Never blocks.
    ///
    /// Returns false if it was dropped because the queue is full or the
    /// dispatcher has shut down.
    pub fn enqueue(&self, mut notification: Notification) -> bool {
        notification.status = DeliveryStatus::Queued;
        if notification.channels.is_empty() {
            notification.channels = self.inner.default_channels.clone();
        }
        if notification.max_retries.is_none() {
            notification.max_retries = Some(self.inner.config.max_retries);
        }

        let id = notification.id;
        let kind = notification.kind;
        self.inner.log.insert(id, notification.clone());

        match self.inner.tx.try_send(notification) {
            Ok(()) => {
                self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(notification_id = %id, kind = %kind, "Notification queued");
                true
            }
            Err(e) => {
                let reason = self.inner.drop_rejected(e);
                error!(notification_id = %id, kind = %kind, reason, "Notification dropped");
                false
            }
        }
    }

    /// A queued, retrying, failed or dropped notification.
    ///
    /// Delivered notifications are forgotten once delivered.
    pub fn get(&self, id: Uuid) -> Option<Notification> {
        if let Some(n) = self.inner.log.get(&id) {
            return Some(n.clone());
        }
        self.inner
            .lock_failures()
            .iter()
            .rev()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Notifications whose retries are exhausted, oldest first
    pub fn failed(&self) -> Vec<Notification> {
        self.inner
            .lock_failures()
            .iter()
            .filter(|n| n.status == DeliveryStatus::Failed)
            .cloned()
            .collect()
    }

    /// Notifications queued or awaiting a retry
    pub fn pending(&self) -> usize {
        self.inner.log.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker pool. Queued items and pending retries are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Notification worker ended abnormally");
            }
        }
        info!(stats = ?self.stats(), "Notification dispatcher stopped");
    }
}

impl Inner {
    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<Notification>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Move a terminal failure out of the live log into the bounded history.
    fn record_failure(&self, n: Notification) {
        self.log.remove(&n.id);
        let mut failures = self.lock_failures();
        if failures.len() >= FAILURE_HISTORY {
            failures.pop_front();
        }
        failures.push_back(n);
    }

    fn drop_rejected(&self, e: TrySendError<Notification>) -> &'static str {
        let (reason, mut n) = match e {
            TrySendError::Full(n) => ("queue full", n),
            TrySendError::Closed(n) => ("dispatcher stopped", n),
        };
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        n.status = DeliveryStatus::Dropped;
        n.failed_at = Some(Utc::now());
        n.last_error = Some(reason.to_string());
        self.record_failure(n);
        reason
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(
    id: usize,
    inner: Arc<Inner>,
    rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
) {
    let mut shutdown = inner.shutdown.clone();
    debug!(worker = id, "Notification worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(notification) = next else {
            break;
        };
        process(&inner, notification).await;
    }
    debug!(worker = id, "Notification worker stopped");
}

async fn process(inner: &Arc<Inner>, mut n: Notification) {
    let mut errors: Vec<String> = Vec::new();
    let mut delivered_on: Vec<ChannelKind> = Vec::new();

    for kind in &n.channels {
        let result = match inner.channels.get(kind) {
            Some(channel) => channel.deliver(&n).await,
            None => Err(DeliveryError::Unregistered(*kind)),
        };
        match result {
            Ok(()) => delivered_on.push(*kind),
            Err(e) => {
                warn!(notification_id = %n.id, channel = %kind, error = %e, "Channel delivery failed");
                errors.push(format!("{}: {}", kind, e));
            }
        }
    }

    if !delivered_on.is_empty() {
        n.status = DeliveryStatus::Delivered;
        n.delivered_at = Some(Utc::now());
        n.last_error = (!errors.is_empty()).then(|| errors.join("; "));
        inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(notification_id = %n.id, channels = ?delivered_on, "Notification delivered");
        inner.log.remove(&n.id);
        return;
    }

    n.last_error = Some(if errors.is_empty() {
        "no channels".to_string()
    } else {
        errors.join("; ")
    });

    let max_retries = n.max_retries.unwrap_or(inner.config.max_retries);
    if n.retry_count >= max_retries {
        n.status = DeliveryStatus::Failed;
        n.failed_at = Some(Utc::now());
        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            notification_id = %n.id,
            kind = %n.kind,
            retries = n.retry_count,
            error = n.last_error.as_deref().unwrap_or_default(),
            "Notification delivery failed permanently"
        );
        inner.record_failure(n);
        return;
    }

    n.retry_count += 1;
    n.status = DeliveryStatus::Retrying;
    inner.counters.retried.fetch_add(1, Ordering::Relaxed);
    inner.log.insert(n.id, n.clone());

    let delay = inner.config.retry_delay * n.retry_count;
    debug!(notification_id = %n.id, retry = n.retry_count, delay_ms = delay.as_millis() as u64, "Scheduling notification retry");
    tokio::spawn(reschedule(inner.clone(), n, delay));
}

/// Re-enqueue after `delay` (linear backoff).
async fn reschedule(inner: Arc<Inner>, n: Notification, delay: Duration) {
    let mut shutdown = inner.shutdown.clone();
    if *shutdown.borrow() {
        inner.log.remove(&n.id);
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {
            info!(notification_id = %n.id, "Dispatcher stopping, pending retry dropped");
            inner.log.remove(&n.id);
            return;
        }
    }

    let id = n.id;
    if let Err(e) = inner.tx.try_send(n) {
        let reason = inner.drop_rejected(e);
        error!(notification_id = %id, reason, "Notification retry dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{InAppChannel, LogChannel, NotificationKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FlakyChannel {
        kind: ChannelKind,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyChannel {
        fn new(kind: ChannelKind, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                kind,
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for FlakyChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(&self, _n: &Notification) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::Http(503));
            }
            Ok(())
        }
    }

    /// Blocks every delivery until released
    struct GateChannel {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl NotificationChannel for GateChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Log
        }

        async fn deliver(&self, _n: &Notification) -> Result<(), DeliveryError> {
            let _permit = self.gate.acquire().await.map_err(|e| DeliveryError::Transport(e.to_string()))?;
            Ok(())
        }
    }

    fn config(queue_size: usize, max_retries: u32) -> NotificationConfig {
        NotificationConfig {
            queue_size,
            worker_count: 2,
            max_retries,
            retry_delay: Duration::from_millis(10),
            webhook_url: None,
        }
    }

    /// Wait for a notification to fail for good
    async fn wait_for_failure(dispatcher: &NotificationDispatcher, id: Uuid) -> Notification {
        for _ in 0..200 {
            if let Some(n) = dispatcher.get(id)
                && n.status.is_terminal()
            {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("notification {id} never reached a terminal state");
    }

    async fn wait_for_delivered(dispatcher: &NotificationDispatcher, count: u64) {
        for _ in 0..200 {
            if dispatcher.stats().delivered >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} deliveries");
    }

    #[tokio::test]
    async fn test_delivers_on_any_channel() {
        let inbox = Arc::new(InAppChannel::new());
        let broken = FlakyChannel::new(ChannelKind::Webhook, usize::MAX);
        let dispatcher = NotificationDispatcher::start(config(16, 3), vec![inbox.clone(), broken]);

        let n = Notification::new(NotificationKind::StatusChange, "Confirmed", "t1")
            .with_recipients(vec!["ops".into()]);
        let id = n.id;
        assert!(dispatcher.enqueue(n));

        wait_for_delivered(&dispatcher, 1).await;
        assert_eq!(inbox.inbox("ops").len(), 1);
        assert!(dispatcher.get(id).is_none());
        assert!(dispatcher.failed().is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_then_delivers() {
        let flaky = FlakyChannel::new(ChannelKind::Webhook, 2);
        let dispatcher = NotificationDispatcher::start(config(16, 3), vec![flaky.clone()]);

        let n = Notification::new(NotificationKind::PendingApproval, "Approve", "t2");
        dispatcher.enqueue(n);

        wait_for_delivered(&dispatcher, 1).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().retried, 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_stay_queryable() {
        let broken = FlakyChannel::new(ChannelKind::Webhook, usize::MAX);
        let dispatcher = NotificationDispatcher::start(config(16, 2), vec![broken.clone()]);

        let n = Notification::new(NotificationKind::StaleTransfer, "Stale", "t3");
        let id = n.id;
        dispatcher.enqueue(n);

        let done = wait_for_failure(&dispatcher, id).await;
        assert_eq!(done.status, DeliveryStatus::Failed);
        assert!(done.failed_at.is_some());
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.failed().len(), 1);
        assert_eq!(dispatcher.stats().failed, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_channel_counts_as_failure() {
        let dispatcher = NotificationDispatcher::start(config(16, 0), vec![Arc::new(LogChannel)]);
        let n = Notification::new(NotificationKind::System, "x", "y")
            .with_channels(vec![ChannelKind::Email]);
        let id = n.id;
        dispatcher.enqueue(n);

        let done = wait_for_failure(&dispatcher, id).await;
        assert_eq!(done.status, DeliveryStatus::Failed);
        assert!(done.last_error.unwrap().contains("email"));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_only_retains_undelivered() {
        let flaky = FlakyChannel::new(ChannelKind::Webhook, 0);
        let dispatcher = NotificationDispatcher::start(config(64, 0), vec![flaky.clone()]);

        for i in 0..50 {
            dispatcher.enqueue(Notification::new(NotificationKind::System, "n", format!("{i}")));
        }
        wait_for_delivered(&dispatcher, 50).await;
        assert_eq!(dispatcher.pending(), 0);

        flaky.failures_left.store(usize::MAX, Ordering::SeqCst);
        let n = Notification::new(NotificationKind::StaleTransfer, "Stale", "t4");
        let id = n.id;
        dispatcher.enqueue(n);
        assert_eq!(wait_for_failure(&dispatcher, id).await.status, DeliveryStatus::Failed);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(dispatcher.failed().len(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let gate = Arc::new(GateChannel {
            gate: tokio::sync::Semaphore::new(0),
        });
        let dispatcher = NotificationDispatcher::start(
            NotificationConfig {
                worker_count: 1,
                ..config(2, 0)
            },
            vec![gate.clone()],
        );

        // One in the worker's hands, two in the queue, the rest dropped.
        let mut accepted = 0;
        let started = std::time::Instant::now();
        for i in 0..20 {
            if dispatcher.enqueue(Notification::new(NotificationKind::System, "n", format!("{i}"))) {
                accepted += 1;
            }
            tokio::task::yield_now().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(accepted <= 3);
        let stats = dispatcher.stats();
        assert_eq!(stats.dropped, 20 - accepted);
        assert!(stats.dropped >= 17);

        gate.gate.add_permits(100);
        dispatcher.shutdown().await;
    }
}
