//! Custody Orchestrator - service entry point
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌───────────┐    ┌──────────┐
//! │  Config  │───▶│ Reconciler  │───▶│ Custodian │    │ Notifier │
//! │  (YAML)  │    │ (poll loop) │◀───│  (HTTP)   │    │ (queue)  │
//! └──────────┘    └──────┬──────┘    └───────────┘    └────▲─────┘
//!                        └───────────────────────────────────┘
//! ```
//!
//! Request handlers embed `TransferOrchestrator` as a library; this binary
//! runs the background side: the reconciliation worker, the notification
//! dispatcher and the idempotency sweeper.
//!
//! Standalone, the worker reconciles an in-memory store that starts empty.
//! Deployments embedding the library hand the worker their own
//! `TransferStore` and share the idempotency service with their handlers.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use custody_orchestrator::canonical::StatusCanonicalizer;
use custody_orchestrator::client::RemoteClient;
use custody_orchestrator::config::AppConfig;
use custody_orchestrator::custodian::{CustodianApi, HttpCustodian};
use custody_orchestrator::idempotency::{IdempotencyService, MemoryIdempotencyStore};
use custody_orchestrator::logging::init_logging;
use custody_orchestrator::notify::{
    InAppChannel, LogChannel, NotificationChannel, NotificationDispatcher, WebhookChannel,
};
use custody_orchestrator::reconcile::ReconciliationWorker;
use custody_orchestrator::store::{MemoryTransferStore, TransferStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load_env(&env).with_context(|| format!("loading {} config", env))?;
    config.validate().context("validating config")?;

    let _guard = init_logging(&config.logging);
    info!(env = %env, build = custody_orchestrator::GIT_HASH, "Custody orchestrator starting");
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ============================================================
    // CUSTODIAN + IDEMPOTENCY
    // ============================================================

    let client = RemoteClient::new(&config.custodian).context("building custodian client")?;
    info!(base_url = client.base_url(), "Custodian client ready");
    let custodian: Arc<dyn CustodianApi> = Arc::new(HttpCustodian::new(client));

    let idempotency = IdempotencyService::new(
        Arc::new(MemoryIdempotencyStore::new()),
        config.idempotency.clone(),
    );
    let sweeper = idempotency.spawn_sweeper(shutdown_rx.clone());

    let canonicalizer = StatusCanonicalizer::new(config.risk.clone(), config.sla.clone());

    // ============================================================
    // NOTIFICATIONS
    // ============================================================

    let mut channels: Vec<Arc<dyn NotificationChannel>> =
        vec![Arc::new(LogChannel), Arc::new(InAppChannel::new())];
    if let Some(url) = &config.notifications.webhook_url {
        let webhook = WebhookChannel::new(url.clone(), WebhookChannel::DEFAULT_TIMEOUT)
            .context("building webhook channel")?;
        channels.push(Arc::new(webhook));
    }
    let dispatcher = Arc::new(NotificationDispatcher::start(
        config.notifications.clone(),
        channels,
    ));

    // ============================================================
    // RECONCILIATION
    // ============================================================

    let store: Arc<dyn TransferStore> = Arc::new(MemoryTransferStore::new());
    warn!("No persistent transfer store configured, reconciling an in-memory store");
    let worker = ReconciliationWorker::new(
        config.reconciliation.clone(),
        store,
        custodian,
        canonicalizer,
        dispatcher.clone(),
    );
    worker.start().await.context("starting reconciliation worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = worker.stop().await {
        error!(error = %e, "Reconciliation worker did not stop cleanly");
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        error!(error = %e, "Idempotency sweeper task failed");
    }
    dispatcher.shutdown().await;

    let health = worker.health_check();
    info!(
        ticks = health.ticks,
        processed = health.processed,
        updated = health.updated,
        notifications = health.notifications,
        "Custody orchestrator stopped"
    );
    Ok(())
}
