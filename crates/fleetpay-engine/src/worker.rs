//! # Settlement Worker
//!
//! Background loop that settles what the request path left open.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SettlementWorker tick                              │
//! │                                                                         │
//! │  1. WebhookReconciler::retry_due         pending events past due       │
//! │  2. SettlementService::reconcile_unknown  unknown / stale in-flight    │
//! │  3. purge processed webhook events        at most once an hour         │
//! │                                                                         │
//! │  TIMING:                                                               │
//! │  • Tick interval: settlement.reconcile_interval_secs (default 30s)     │
//! │  • Retention: webhook.retention_days (default 30)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failing step is logged and the next tick tries again; the worker only
//! stops on shutdown.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};
use crate::reconciler::{RetryReport, WebhookReconciler};
use crate::settlement::{ReconcileReport, SettlementService};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Handle for stopping a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl WorkerHandle {
    /// Triggers graceful shutdown. The current tick finishes first.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::Internal("settlement worker already stopped".into()))
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub webhooks: RetryReport,
    pub attempts: ReconcileReport,
    pub purged: u64,
}

pub struct SettlementWorker {
    settlement: SettlementService,
    reconciler: WebhookReconciler,
    interval: Duration,
    retention: chrono::Duration,
    last_purge: Option<Instant>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl SettlementWorker {
    /// Creates a worker and returns its handle.
    pub fn new(
        settlement: SettlementService,
        reconciler: WebhookReconciler,
        interval: Duration,
        retention_days: u32,
    ) -> (Self, WorkerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = SettlementWorker {
            settlement,
            reconciler,
            interval,
            retention: chrono::Duration::days(i64::from(retention_days)),
            last_purge: None,
            shutdown_rx,
        };

        (worker, WorkerHandle { shutdown_tx })
    }

    /// Runs the loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Settlement worker starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Settlement worker shutting down");
                    break;
                }
            }
        }

        info!("Settlement worker stopped");
    }

    /// Runs every step once.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        match self.reconciler.retry_due().await {
            Ok(r) => report.webhooks = r,
            Err(e) => error!(error = %e, "Failed to retry webhook events"),
        }

        match self.settlement.reconcile_unknown_attempts().await {
            Ok(r) => report.attempts = r,
            Err(e) => error!(error = %e, "Failed to reconcile unknown attempts"),
        }

        let purge_due = self
            .last_purge
            .map_or(true, |at| at.elapsed() >= PURGE_INTERVAL);
        if purge_due {
            let cutoff = Utc::now() - self.retention;
            match self.reconciler.purge_processed_before(cutoff).await {
                Ok(purged) => {
                    report.purged = purged;
                    self.last_purge = Some(Instant::now());
                }
                Err(e) => error!(error = %e, "Failed to purge webhook events"),
            }
        }

        debug!(?report, "Settlement worker tick");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SettlementSettings, WebhookSettings};
    use crate::connect::ConnectManager;
    use crate::processor::mock::MockGateway;
    use crate::processor::{ProcessorError, ProcessorGateway};
    use fleetpay_core::{AttemptStatus, Booking, TenantAccount, WebhookStatus};
    use fleetpay_db::{Database, DbConfig};
    use std::sync::Arc;

    const TENANT: &str = "tenant-1";
    const METHOD: &str = "pm_card_visa";

    async fn setup() -> (Database, Arc<MockGateway>, SettlementService, WebhookReconciler, Booking) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();

        let mut account = TenantAccount::new(TENANT, 1000, now);
        account.processor_account_id = Some("acct_1".into());
        account.charges_enabled = true;
        account.payouts_enabled = true;
        account.onboarding_complete = true;
        db.tenants().save(&account).await.unwrap();

        let booking = Booking::new(TENANT, "cust-1", 20000, "USD", now);
        db.bookings().insert(&booking).await.unwrap();

        let mock = Arc::new(MockGateway::new());
        let gateway: Arc<dyn ProcessorGateway> = mock.clone();
        let settings = SettlementSettings::default();
        let settlement = SettlementService::new(db.clone(), gateway.clone(), &settings);
        let webhook = WebhookSettings {
            initial_retry_secs: 0,
            ..Default::default()
        };
        let reconciler = WebhookReconciler::new(
            db.clone(),
            ConnectManager::new(db.clone(), gateway),
            &webhook,
            &settings,
        );

        (db, mock, settlement, reconciler, booking)
    }

    #[tokio::test]
    async fn test_tick_settles_open_work() {
        let (db, mock, settlement, reconciler, booking) = setup().await;

        // An ambiguous charge and an event that arrived before its transfer.
        mock.fail_next("charge", ProcessorError::Timeout);
        let err = settlement
            .charge_booking(TENANT, &booking.id, 20000, METHOD)
            .await
            .unwrap_err();
        let EngineError::OutcomeUnknown { idempotency_key } = err else {
            panic!("expected OutcomeUnknown, got {err}");
        };
        let raw = br#"{"id":"evt_1","type":"transfer.paid","data":{"object":{"id":"tr_missing"}}}"#;
        reconciler.handle(raw).await.unwrap();

        let (mut worker, _handle) =
            SettlementWorker::new(settlement, reconciler, Duration::from_secs(30), 30);
        let report = worker.tick().await;

        assert_eq!(report.attempts.resolved, 1);
        assert_eq!(report.webhooks.deferred, 1);
        let attempt = db.attempts().get(&idempotency_key).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Succeeded);
        let event = db.webhooks().get("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Pending);
        assert_eq!(event.retry_count, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_db, _mock, settlement, reconciler, _booking) = setup().await;
        let (worker, handle) =
            SettlementWorker::new(settlement, reconciler, Duration::from_millis(10), 30);

        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.shutdown().await.is_err());
    }
}
