//! Reconciliation Worker
//!
//! One scheduling loop fetches a bounded batch of non-terminal transfers per
//! tick and hands them to a fixed pool of workers over a bounded channel.
//! A failed or slow transfer only affects itself: the next tick is its retry.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashSet;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{WorkerError, WorkerState};
use crate::canonical::{
    ApprovalSummary, CanonicalStatus, RiskLevel, SlaProfile, StatusCanonicalizer, WalletClass,
};
use crate::config::{ReconcileConfig, validate_reconcile};
use crate::custodian::{CustodianApi, CustodianTransfer, PendingApproval, Recipient};
use crate::notify::{Notification, NotificationDispatcher, NotificationKind, Priority};
use crate::store::{TransferRecord, TransferStore, WalletRecord};

/// Result of reconciling one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    /// Not yet submitted; nothing to poll
    Skipped,
    Unchanged,
    Updated,
    Failed,
    /// Already being processed by another worker
    Busy,
}

/// Outcome of one synchronous tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub failed: usize,
    pub busy: usize,
}

impl TickSummary {
    fn record(&mut self, result: ItemResult) {
        match result {
            ItemResult::Skipped => self.skipped += 1,
            ItemResult::Unchanged => self.unchanged += 1,
            ItemResult::Updated => self.updated += 1,
            ItemResult::Failed => self.failed += 1,
            ItemResult::Busy => self.busy += 1,
        }
    }
}

/// Liveness summary for health-check collaborators
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: WorkerState,
    /// Running with a live scheduling loop
    pub healthy: bool,
    pub config: ReconcileConfig,
    pub ticks: u64,
    pub processed: u64,
    pub updated: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub notifications: u64,
    pub in_flight: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub build: &'static str,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    processed: AtomicU64,
    updated: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    notifications: AtomicU64,
    /// Unix millis of the last tick, 0 before the first
    last_tick_ms: AtomicI64,
}

struct Shared {
    config: ReconcileConfig,
    store: Arc<dyn TransferStore>,
    custodian: Arc<dyn CustodianApi>,
    canonicalizer: StatusCanonicalizer,
    notifier: Arc<NotificationDispatcher>,
    state: RwLock<WorkerState>,
    scheduler_alive: AtomicBool,
    in_flight: DashSet<String>,
    counters: Counters,
}

struct RunHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Kept so jobs still queued at stop can have their claims released
    jobs: Arc<Mutex<mpsc::Receiver<TransferRecord>>>,
}

pub struct ReconciliationWorker {
    shared: Arc<Shared>,
    control: Mutex<Option<RunHandles>>,
}

impl ReconciliationWorker {
    pub fn new(
        config: ReconcileConfig,
        store: Arc<dyn TransferStore>,
        custodian: Arc<dyn CustodianApi>,
        canonicalizer: StatusCanonicalizer,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                custodian,
                canonicalizer,
                notifier,
                state: RwLock::new(WorkerState::Stopped),
                scheduler_alive: AtomicBool::new(false),
                in_flight: DashSet::new(),
                counters: Counters::default(),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.shared.config
    }

    /// Spawn the worker pool and the scheduling loop.
    ///
    /// The first poll runs immediately. Rejected unless stopped.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut control = self.control.lock().await;
        let state = self.shared.state();
        if state != WorkerState::Stopped {
            return Err(WorkerError::AlreadyRunning(state));
        }
        validate_reconcile(&self.shared.config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorkerError::Startup(e.to_string()))?;

        self.shared.set_state(WorkerState::Starting);
        let config = &self.shared.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (jobs_tx, jobs_rx) = mpsc::channel(config.batch_size);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut tasks = Vec::with_capacity(config.worker_count + 1);
        for id in 0..config.worker_count {
            tasks.push(runtime.spawn(run_worker(
                id,
                self.shared.clone(),
                jobs_rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        self.shared.scheduler_alive.store(true, Ordering::SeqCst);
        tasks.push(runtime.spawn(run_scheduler(
            self.shared.clone(),
            jobs_tx,
            shutdown_rx,
        )));

        *control = Some(RunHandles {
            shutdown: shutdown_tx,
            tasks,
            jobs: jobs_rx,
        });
        self.shared.set_state(WorkerState::Running);

        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            batch_size = config.batch_size,
            workers = config.worker_count,
            item_timeout_ms = config.item_timeout.as_millis() as u64,
            "Reconciliation worker started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for the scheduler and workers to drain.
    ///
    /// In-flight items keep their own timeout. If everything has not drained
    /// within `shutdown_timeout` the tasks are aborted and
    /// `ShutdownTimeout` is returned; the worker is stopped either way.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut control = self.control.lock().await;
        let state = self.shared.state();
        if state != WorkerState::Running {
            return Err(WorkerError::NotRunning(state));
        }
        let Some(handles) = control.take() else {
            return Err(WorkerError::NotRunning(state));
        };

        self.shared.set_state(WorkerState::Stopping);
        info!("Stopping reconciliation worker");
        let _ = handles.shutdown.send(true);

        let aborts: Vec<_> = handles.tasks.iter().map(|t| t.abort_handle()).collect();
        let timeout = self.shared.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles.tasks)).await;

        self.shared.scheduler_alive.store(false, Ordering::SeqCst);

        match drained {
            Ok(results) => {
                let released = self.shared.release_queued(&handles.jobs).await;
                if released > 0 {
                    info!(released, "Released queued transfers for the next run");
                }
                self.shared.set_state(WorkerState::Stopped);
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Reconciliation task ended abnormally");
                    }
                }
                info!("Reconciliation worker stopped");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                self.shared.release_queued(&handles.jobs).await;
                self.shared.in_flight.clear();
                self.shared.set_state(WorkerState::Stopped);
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Reconciliation workers did not drain in time, aborted"
                );
                Err(WorkerError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn health_check(&self) -> HealthSnapshot {
        let shared = &self.shared;
        let c = &shared.counters;
        let state = shared.state();
        let last_tick_ms = c.last_tick_ms.load(Ordering::Relaxed);

        HealthSnapshot {
            state,
            healthy: state == WorkerState::Running && shared.scheduler_alive.load(Ordering::SeqCst),
            config: shared.config.clone(),
            ticks: c.ticks.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            updated: c.updated.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            notifications: c.notifications.load(Ordering::Relaxed),
            in_flight: shared.in_flight.len(),
            last_tick_at: (last_tick_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_tick_ms).single())
                .flatten(),
            build: crate::GIT_HASH,
        }
    }

    /// Run one tick inline and wait for every item in it.
    ///
    /// Works whether or not the background loop is running; transfers the
    /// loop is already processing are reported as busy.
    pub async fn poll_once(&self) -> Result<TickSummary, WorkerError> {
        let shared = &self.shared;
        shared.mark_tick();
        let batch = shared.fetch_batch().await.inspect_err(|_| {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
        })?;

        let mut summary = TickSummary {
            fetched: batch.len(),
            ..Default::default()
        };
        let results: Vec<ItemResult> = stream::iter(batch)
            .map(|record| async move {
                if !shared.claim(&record.id) {
                    return ItemResult::Busy;
                }
                shared.process_claimed(record).await
            })
            .buffer_unordered(shared.config.worker_count.max(1))
            .collect()
            .await;

        for result in results {
            summary.record(result);
        }
        debug!(?summary, "Reconciliation poll completed");
        Ok(summary)
    }
}

// ============================================================================
// Scheduler and worker tasks
// ============================================================================

async fn run_scheduler(
    shared: Arc<Shared>,
    jobs: mpsc::Sender<TransferRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(shared.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if AssertUnwindSafe(shared.dispatch_tick(&jobs)).catch_unwind().await.is_err() {
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!("Reconciliation tick panicked");
                }
            }
        }
    }

    shared.scheduler_alive.store(false, Ordering::SeqCst);
    debug!("Reconciliation scheduler exited");
}

async fn run_worker(
    id: usize,
    shared: Arc<Shared>,
    jobs: Arc<Mutex<mpsc::Receiver<TransferRecord>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Reconciliation worker task started");
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
            next = async { jobs.lock().await.recv().await } => next,
        };
        let Some(record) = next else {
            break;
        };
        shared.process_claimed(record).await;
    }
    debug!(worker = id, "Reconciliation worker task exited");
}

// ============================================================================
// Per-transfer processing
// ============================================================================

impl Shared {
    fn state(&self) -> WorkerState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: WorkerState) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn mark_tick(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_tick_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn claim(&self, transfer_id: &str) -> bool {
        self.in_flight.insert(transfer_id.to_string())
    }

    /// Drop jobs that were dispatched but never picked up, releasing their
    /// claims. Only called once the scheduler (the sole sender) has exited.
    async fn release_queued(&self, jobs: &Mutex<mpsc::Receiver<TransferRecord>>) -> usize {
        let mut jobs = jobs.lock().await;
        let mut released = 0;
        while let Ok(record) = jobs.try_recv() {
            self.in_flight.remove(&record.id);
            released += 1;
        }
        released
    }

    async fn fetch_batch(&self) -> Result<Vec<TransferRecord>, WorkerError> {
        Ok(self
            .store
            .list_transfers_by_status(&CanonicalStatus::NON_TERMINAL, self.config.batch_size)
            .await?)
    }

    async fn dispatch_tick(&self, jobs: &mpsc::Sender<TransferRecord>) {
        self.mark_tick();
        let batch = match self.fetch_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to fetch transfers for reconciliation");
                return;
            }
        };
        if batch.is_empty() {
            debug!("No in-flight transfers to reconcile");
            return;
        }

        let fetched = batch.len();
        let (mut dispatched, mut busy, mut deferred) = (0usize, 0usize, 0usize);
        for record in batch {
            if !self.claim(&record.id) {
                busy += 1;
                continue;
            }
            let id = record.id.clone();
            if jobs.try_send(record).is_err() {
                self.in_flight.remove(&id);
                deferred += 1;
            } else {
                dispatched += 1;
            }
        }
        debug!(fetched, dispatched, busy, deferred, "Reconciliation tick dispatched");
    }

    /// Process a transfer already claimed in `in_flight`, releasing the
    /// claim when done. Timeouts and panics are contained here.
    async fn process_claimed(&self, record: TransferRecord) -> ItemResult {
        let id = record.id.clone();
        let outcome = tokio::time::timeout(
            self.config.item_timeout,
            AssertUnwindSafe(self.process_transfer(record)).catch_unwind(),
        )
        .await;
        self.in_flight.remove(&id);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(Ok(result))) => {
                if result == ItemResult::Updated {
                    self.counters.updated.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            Ok(Ok(Err(e))) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(transfer_id = %id, code = e.code(), error = %e, "Reconciliation failed, will retry next tick");
                ItemResult::Failed
            }
            Ok(Err(_)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                error!(transfer_id = %id, "Reconciliation panicked, will retry next tick");
                ItemResult::Failed
            }
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    transfer_id = %id,
                    timeout_ms = self.config.item_timeout.as_millis() as u64,
                    "Reconciliation timed out, will retry next tick"
                );
                ItemResult::Failed
            }
        }
    }

    async fn process_transfer(&self, record: TransferRecord) -> Result<ItemResult, WorkerError> {
        let wallet = self.store.get_wallet(&record.wallet_id).await?;
        let Some(custodian_id) = record.custodian_transfer_id.as_deref() else {
            debug!(transfer_id = %record.id, "No custodian transfer id yet, skipping");
            return Ok(ItemResult::Skipped);
        };

        let remote = self
            .custodian
            .get_transfer(&record.coin, &wallet.custodian_wallet_id, custodian_id)
            .await?;
        let now = Utc::now();
        let observed = self.canonicalizer.normalize(&remote.state, &remote);

        let class = record.transfer_class;
        let risk = self.canonicalizer.assess_risk(
            &record.coin,
            &[Recipient {
                address: record.recipient.clone(),
                amount: record.amount.clone(),
            }],
            class,
        );
        let sla = self.canonicalizer.get_sla(class, risk);

        let mut next = record.clone();
        let status_changed = absorb_status(&mut next, observed, &remote.state, now);
        absorb_remote_fields(&mut next, &remote);

        // Counts are refreshed every tick while waiting; approvers are only
        // notified on entry or when the counts move.
        let approval = if next.status == CanonicalStatus::WaitingApproval {
            let before = (next.received_approvals, next.required_approvals);
            let summary = self
                .approval_detail(&mut next, &wallet, &remote, risk, class, &sla, now)
                .await;
            let progressed = (next.received_approvals, next.required_approvals) != before;
            (status_changed || progressed).then_some(summary)
        } else {
            None
        };

        let escalate = next.stale_notified_at.is_none()
            && sla.is_stale(next.created_at, next.status, now);
        if escalate {
            next.stale_notified_at = Some(now);
        }

        if next == record {
            debug!(transfer_id = %record.id, status = %record.status, "Transfer unchanged");
            return Ok(ItemResult::Unchanged);
        }
        next.updated_at = now;
        self.store.update_transfer(&next).await?;

        if status_changed {
            info!(
                transfer_id = %next.id,
                from = %record.status,
                to = %next.status,
                custodian_state = %remote.state,
                "Transfer status changed"
            );
            self.notify(status_change(&next, record.status, self.recipients(&next)));
        }
        if let Some(summary) = approval {
            self.notify(pending_approval(&next, class, &summary, self.recipients(&next)));
        }
        if escalate {
            warn!(
                transfer_id = %next.id,
                status = %next.status,
                max_wait_secs = sla.max_wait_time.as_secs(),
                "Transfer exceeded its SLA"
            );
            self.notify(stale_transfer(&next, &sla, now, self.recipients(&next)));
        }
        Ok(ItemResult::Updated)
    }

    /// Current approval counts for a transfer in `waiting_approval`.
    ///
    /// A failed approval lookup is not fatal: the record keeps what it knows.
    #[allow(clippy::too_many_arguments)]
    async fn approval_detail(
        &self,
        next: &mut TransferRecord,
        wallet: &WalletRecord,
        remote: &CustodianTransfer,
        risk: RiskLevel,
        class: WalletClass,
        sla: &SlaProfile,
        now: DateTime<Utc>,
    ) -> ApprovalSummary {
        let fallback_required = if next.required_approvals > 0 {
            next.required_approvals
        } else {
            self.canonicalizer.required_approvals(risk, class)
        };
        let mut received = next.received_approvals;
        let mut required = fallback_required;
        let mut requested_at = next.submitted_at.unwrap_or(now);

        match self
            .custodian
            .list_pending_approvals(&wallet.custodian_wallet_id)
            .await
        {
            Ok(approvals) => {
                if let Some(approval) = find_approval(&approvals, remote) {
                    received = approval.approvals_received;
                    if approval.approvals_required > 0 {
                        required = approval.approvals_required;
                    }
                    if let Some(created) = approval.create_date {
                        requested_at = created;
                    }
                }
            }
            Err(e) => {
                warn!(transfer_id = %next.id, error = %e, "Failed to fetch approval detail");
            }
        }

        next.set_approvals(received, required);
        self.canonicalizer.approval_summary(
            next.received_approvals,
            next.required_approvals,
            sla,
            requested_at,
            now,
        )
    }

    fn recipients(&self, record: &TransferRecord) -> Vec<String> {
        let mut recipients = self.config.operator_recipients.clone();
        if let Some(initiator) = &record.initiated_by
            && !recipients.contains(initiator)
        {
            recipients.push(initiator.clone());
        }
        recipients
    }

    fn notify(&self, notification: Notification) {
        if self.notifier.enqueue(notification) {
            self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Apply the observed status if it keeps the lifecycle monotonic.
fn absorb_status(
    next: &mut TransferRecord,
    observed: CanonicalStatus,
    custodian_state: &str,
    now: DateTime<Utc>,
) -> bool {
    if observed == next.status {
        return false;
    }
    if observed == CanonicalStatus::Unknown {
        warn!(
            transfer_id = %next.id,
            custodian_state,
            current = %next.status,
            "Unrecognized custodian state, keeping current status"
        );
        return false;
    }
    if next.apply_status(observed, now) {
        return true;
    }
    warn!(
        transfer_id = %next.id,
        current = %next.status,
        observed = %observed,
        "Ignoring regressive custodian status"
    );
    false
}

/// Copy custodian-assigned facts the record has not seen yet.
fn absorb_remote_fields(next: &mut TransferRecord, remote: &CustodianTransfer) {
    if next.tx_hash.is_none() && remote.has_txid() {
        next.tx_hash = remote.txid.clone();
    }
    if next.fee.is_none()
        && let Some(fee) = &remote.fee_string
    {
        next.fee = Some(fee.clone());
    }
}

fn find_approval<'a>(
    approvals: &'a [PendingApproval],
    remote: &CustodianTransfer,
) -> Option<&'a PendingApproval> {
    approvals.iter().find(|a| {
        a.transfer_id.as_deref() == Some(remote.id.as_str())
            || remote.pending_approval.as_deref() == Some(a.id.as_str())
    })
}

// ============================================================================
// Notifications
// ============================================================================

fn transfer_payload(record: &TransferRecord) -> serde_json::Value {
    json!({
        "transfer_id": record.id,
        "wallet_id": record.wallet_id,
        "coin": record.coin,
        "amount": record.amount,
        "recipient": record.recipient,
        "status": record.status,
        "custodian_transfer_id": record.custodian_transfer_id,
        "tx_hash": record.tx_hash,
    })
}

fn status_change(
    record: &TransferRecord,
    previous: CanonicalStatus,
    recipients: Vec<String>,
) -> Notification {
    let priority = if record.status.is_failure() {
        Priority::High
    } else if record.status == CanonicalStatus::Confirmed {
        Priority::Normal
    } else {
        Priority::Low
    };
    let mut payload = transfer_payload(record);
    payload["previous_status"] = json!(previous);

    Notification::new(
        NotificationKind::StatusChange,
        format!("Transfer {} is now {}", record.id, record.status),
        record.status.description(),
    )
    .with_priority(priority)
    .with_recipients(recipients)
    .with_payload(payload)
}

fn pending_approval(
    record: &TransferRecord,
    class: WalletClass,
    summary: &ApprovalSummary,
    recipients: Vec<String>,
) -> Notification {
    let remaining = match summary.seconds_remaining {
        Some(secs) => format!(", {}h{:02}m left in the approval window", secs / 3600, (secs % 3600) / 60),
        None => String::new(),
    };
    let mut payload = transfer_payload(record);
    payload["approvals"] = json!(summary);

    Notification::new(
        NotificationKind::PendingApproval,
        format!("Transfer {} needs approval", record.id),
        format!(
            "{} of {} approvals received for {} {} from {} wallet{}",
            summary.received, summary.required, record.amount, record.coin, class, remaining
        ),
    )
    .with_priority(if class == WalletClass::Cold {
        Priority::High
    } else {
        Priority::Normal
    })
    .with_recipients(recipients)
    .with_payload(payload)
}

fn stale_transfer(
    record: &TransferRecord,
    sla: &SlaProfile,
    now: DateTime<Utc>,
    recipients: Vec<String>,
) -> Notification {
    let age_hours = (now - record.created_at).num_hours();
    let mut payload = transfer_payload(record);
    payload["age_hours"] = json!(age_hours);
    payload["sla"] = json!(sla);

    Notification::new(
        NotificationKind::StaleTransfer,
        format!("Transfer {} is stale", record.id),
        format!(
            "Still {} after {}h, beyond the {}h maximum wait",
            record.status,
            age_hours,
            sla.max_wait_time.as_secs() / 3600
        ),
    )
    .with_priority(Priority::Critical)
    .with_recipients(recipients)
    .with_payload(payload)
}
