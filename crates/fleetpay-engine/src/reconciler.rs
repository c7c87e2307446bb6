//! # Webhook Reconciler
//!
//! Feeds processor events through the same ledger path as caller-initiated
//! settlement, so a webhook and an API response for one movement converge
//! on a single ledger entry.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  raw body ──► parse ──► upsert pending ──► processed? ──► Duplicate    │
//! │                                │                                       │
//! │                                ▼                                       │
//! │              classify ──► resolve booking ──► ledger (+ mark, 1 tx)    │
//! │                                │                                       │
//! │                   ┌────────────┼──────────────────┐                    │
//! │                   ▼            ▼                  ▼                    │
//! │              no booking    conflict          other failure             │
//! │            processed+note processed+note   retry w/ backoff            │
//! │                                             └─► failed after max       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Booking Resolution
//! 1. Processor references on the object (payment intent, object id, charge)
//! 2. The idempotency key in `metadata.idempotency_key`
//! 3. `metadata.booking_id`

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{SettlementSettings, WebhookSettings};
use crate::connect::ConnectManager;
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::events::{EventKind, EventObject, ProcessorEvent};
use fleetpay_core::idempotency;
use fleetpay_core::validation::validate_id;
use fleetpay_core::{
    AttemptIntent, AttemptStatus, Booking, Intent, Outcome, PaymentType, TransitionContext,
    WebhookEvent, WebhookStatus,
};
use fleetpay_db::ledger::{self, TransitionCommand};
use fleetpay_db::{BookingKey, Database};

/// What happened to one delivery. Every variant is acknowledged to the
/// processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The ledger changed.
    Applied,
    /// Event or movement already recorded.
    Duplicate,
    /// Processed without a ledger change.
    Noted(String),
    /// Processing failed; scheduled for retry or queued for an operator.
    Deferred,
}

/// Result of one [`WebhookReconciler::retry_due`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub settled: usize,
    pub deferred: usize,
}

enum Plan {
    Apply(Vec<TransitionCommand>),
    Note(String),
}

#[derive(Clone)]
pub struct WebhookReconciler {
    db: Database,
    connect: ConnectManager,
    settings: WebhookSettings,
    hold_window: Duration,
}

impl WebhookReconciler {
    pub fn new(
        db: Database,
        connect: ConnectManager,
        settings: &WebhookSettings,
        settlement: &SettlementSettings,
    ) -> Self {
        WebhookReconciler {
            db,
            connect,
            settings: settings.clone(),
            hold_window: settlement.hold_window(),
        }
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Records and processes one delivery. The body must already be
    /// signature-checked.
    ///
    /// Only an unreadable payload or a storage failure is an error; domain
    /// failures are retried in the background.
    pub async fn handle(&self, raw: &[u8]) -> EngineResult<WebhookOutcome> {
        let event = ProcessorEvent::parse(raw)?;
        validate_id("event_id", &event.id)?;
        let payload =
            std::str::from_utf8(raw).map_err(|e| EngineError::InvalidPayload(e.to_string()))?;

        let stored = self
            .db
            .webhooks()
            .upsert_pending(&event.id, &event.event_type, payload, Utc::now())
            .await?;

        match stored.status {
            WebhookStatus::Processed => {
                debug!(event_id = %event.id, "Duplicate delivery of processed event");
                Ok(WebhookOutcome::Duplicate)
            }
            WebhookStatus::Failed => {
                debug!(event_id = %event.id, "Delivery of an event waiting for an operator");
                Ok(WebhookOutcome::Deferred)
            }
            WebhookStatus::Pending => self.process(&event, stored.retry_count).await,
        }
    }

    /// Processes pending events whose retry is due.
    pub async fn retry_due(&self) -> EngineResult<RetryReport> {
        let now = Utc::now();
        let stale_before = now - Duration::seconds(self.settings.stale_after_secs as i64);
        let events = self
            .db
            .webhooks()
            .due(now, stale_before, self.settings.batch_size)
            .await?;

        let mut report = RetryReport::default();
        for stored in events {
            match self.process_stored(&stored).await? {
                WebhookOutcome::Deferred => report.deferred += 1,
                _ => report.settled += 1,
            }
        }

        if report.settled + report.deferred > 0 {
            info!(
                settled = report.settled,
                deferred = report.deferred,
                "Retried webhook events"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Operator Queue
    // =========================================================================

    /// Events that exhausted their retries.
    pub async fn failed_events(&self, limit: u32) -> EngineResult<Vec<WebhookEvent>> {
        Ok(self.db.webhooks().list_failed(limit).await?)
    }

    /// Resets an event's retry budget and processes it now.
    pub async fn replay(&self, event_id: &str) -> EngineResult<WebhookOutcome> {
        validate_id("event_id", event_id)?;
        let webhooks = self.db.webhooks();

        if !webhooks.reset_for_replay(event_id).await? {
            return match webhooks.get(event_id).await? {
                Some(_) => Ok(WebhookOutcome::Duplicate),
                None => Err(EngineError::not_found("WebhookEvent", event_id)),
            };
        }

        info!(event_id, "Replaying webhook event");
        let stored = webhooks
            .get(event_id)
            .await?
            .ok_or_else(|| EngineError::not_found("WebhookEvent", event_id))?;
        self.process_stored(&stored).await
    }

    /// Deletes processed events older than `cutoff`.
    pub async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let purged = self.db.webhooks().purge_processed_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "Purged processed webhook events");
        }
        Ok(purged)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    async fn process_stored(&self, stored: &WebhookEvent) -> EngineResult<WebhookOutcome> {
        match ProcessorEvent::parse(stored.payload.as_bytes()) {
            Ok(event) => self.process(&event, stored.retry_count).await,
            Err(e) => {
                // Cannot get better by waiting.
                error!(event_id = %stored.id, error = %e, "Stored webhook payload is unreadable");
                self.db
                    .webhooks()
                    .mark_failed(&stored.id, stored.retry_count, &e.to_string())
                    .await?;
                Ok(WebhookOutcome::Deferred)
            }
        }
    }

    async fn process(&self, event: &ProcessorEvent, retry_count: i64) -> EngineResult<WebhookOutcome> {
        debug!(event_id = %event.id, event_type = %event.event_type, "Processing webhook event");

        match self.apply(event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if settles_with_note(&e) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event conflicts with ledger state"
                );
                self.note(&event.id, &format!("conflict: {}", e)).await
            }
            Err(e) => {
                self.defer(&event.id, retry_count, &e).await?;
                Ok(WebhookOutcome::Deferred)
            }
        }
    }

    async fn apply(&self, event: &ProcessorEvent) -> EngineResult<WebhookOutcome> {
        let object = event.object();

        match event.kind() {
            EventKind::Ignored => self.note(&event.id, "ignored event type").await,

            EventKind::AccountUpdated => {
                let snapshot = object.to_account_snapshot();
                match self
                    .connect
                    .sync_by_processor_account(&snapshot, Some(&event.id))
                    .await?
                {
                    Some(_) => Ok(WebhookOutcome::Applied),
                    None => self.note(&event.id, "no tenant owns this account").await,
                }
            }

            EventKind::TransferStatus(to) => {
                let failure = object.failure();
                let update = ledger::apply_transfer_status(
                    &self.db,
                    &object.id,
                    to,
                    failure.as_ref().map(|(c, m)| (c.as_str(), m.as_str())),
                    Some(&event.id),
                    Utc::now(),
                )
                .await?;
                Ok(match update.outcome {
                    Outcome::Applied => WebhookOutcome::Applied,
                    Outcome::AlreadyApplied => WebhookOutcome::Duplicate,
                })
            }

            kind => {
                let Some(key) = self.resolve_booking(object).await? else {
                    info!(event_id = %event.id, object_id = %object.id, "No booking matches webhook event");
                    return self.note(&event.id, "no matching booking").await;
                };
                let booking = ledger::load_booking(&self.db, &key.tenant_id, &key.booking_id).await?;

                match self.plan(kind, object, &booking).await? {
                    Plan::Note(note) => self.note(&event.id, &note).await,
                    Plan::Apply(commands) => self.apply_commands(&event.id, commands).await,
                }
            }
        }
    }

    async fn apply_commands(
        &self,
        event_id: &str,
        commands: Vec<TransitionCommand>,
    ) -> EngineResult<WebhookOutcome> {
        let Some(last) = commands.len().checked_sub(1) else {
            return self.note(event_id, "nothing to apply").await;
        };

        let ctx = TransitionContext::new(Utc::now(), self.hold_window);
        let mut changed = false;
        for (i, cmd) in commands.into_iter().enumerate() {
            // The event is marked with its final movement.
            let cmd = if i == last {
                cmd.webhook(Some(event_id.to_string()))
            } else {
                cmd
            };
            let applied = ledger::apply_transition(&self.db, &cmd, &ctx).await?;
            changed |= applied.outcome == Outcome::Applied;
        }

        Ok(if changed {
            WebhookOutcome::Applied
        } else {
            WebhookOutcome::Duplicate
        })
    }

    /// Maps a booking-scoped event onto ledger commands.
    async fn plan(&self, kind: EventKind, object: &EventObject, booking: &Booking) -> EngineResult<Plan> {
        let payment_intent = object.payment_intent_id().to_string();
        let metadata_key = object.metadata_value("idempotency_key").map(str::to_string);
        let is_deposit = booking.deposit.authorization_ref.as_deref() == Some(payment_intent.as_str());
        let command = |intent: Intent| TransitionCommand::new(&booking.tenant_id, &booking.id, intent);

        let plan = match kind {
            EventKind::AuthorizationConfirmed => {
                let amount_minor = object
                    .amount_capturable
                    .filter(|a| *a > 0)
                    .or(object.amount)
                    .ok_or_else(|| missing("amount"))?;
                Plan::Apply(vec![command(Intent::AuthorizeDeposit {
                    amount_minor,
                    authorization_ref: Some(payment_intent),
                })
                .attempt(metadata_key)])
            }

            EventKind::PaymentSucceeded => {
                if object.captured == Some(false) {
                    return Ok(Plan::Note("charge not captured".into()));
                }
                let amount_minor = object.settled_amount().ok_or_else(|| missing("amount"))?;
                let cmd = if is_deposit {
                    command(Intent::CaptureDeposit {
                        amount_minor,
                        reason: None,
                    })
                    .attempt(Some(idempotency::capture_key(booking)))
                } else {
                    command(Intent::Charge {
                        amount_minor,
                        charge_ref: Some(payment_intent.clone()),
                    })
                    .attempt(metadata_key)
                };
                Plan::Apply(vec![cmd.processor_ref(Some(payment_intent))])
            }

            EventKind::RefundConfirmed => {
                if !refund_completed(object) {
                    return Ok(Plan::Note("refund did not complete".into()));
                }
                Plan::Apply(vec![refund_command(booking, object, None)?])
            }

            EventKind::ChargeRefunded => {
                let refunds = object
                    .refunds
                    .as_ref()
                    .map(|list| list.data.as_slice())
                    .unwrap_or_default();
                let commands = refunds
                    .iter()
                    .filter(|r| refund_completed(r))
                    .map(|r| refund_command(booking, r, Some(&payment_intent)))
                    .collect::<EngineResult<Vec<_>>>()?;
                if commands.is_empty() {
                    return Ok(Plan::Note("no completed refunds listed".into()));
                }
                Plan::Apply(commands)
            }

            EventKind::AuthorizationCanceled => {
                if !is_deposit {
                    return Ok(Plan::Note("canceled payment is not the deposit hold".into()));
                }
                Plan::Apply(vec![command(Intent::ReleaseDeposit { reason: None })
                    .attempt(Some(idempotency::release_key(booking)))])
            }

            EventKind::PaymentFailed => {
                let attempt = match metadata_key.as_deref() {
                    Some(key) => self.db.attempts().get(key).await?,
                    None => None,
                };
                if attempt.as_ref().map(|a| a.status) == Some(AttemptStatus::Failed) {
                    return Ok(Plan::Note("failure already recorded".into()));
                }

                let (code, message) = object
                    .failure()
                    .unwrap_or_else(|| ("payment_failed".into(), String::new()));
                let detail = format!("{}: {}", code, message);
                if let Some(attempt) = &attempt {
                    self.db
                        .attempts()
                        .mark_failed(&attempt.idempotency_key, &detail, Utc::now())
                        .await?;
                }

                let for_deposit = is_deposit
                    || attempt.as_ref().map(|a| a.intent) == Some(AttemptIntent::AuthorizeDeposit);
                let payment_type = if for_deposit {
                    PaymentType::Deposit
                } else {
                    PaymentType::FullPayment
                };
                let amount_minor = object.amount.ok_or_else(|| missing("amount"))?;

                // Never tied to the attempt: that would mark it succeeded.
                Plan::Apply(vec![command(Intent::RecordFailure {
                    payment_type,
                    amount_minor,
                })
                .processor_ref(Some(payment_intent))
                .reason(Some(detail))])
            }

            EventKind::Ignored | EventKind::AccountUpdated | EventKind::TransferStatus(_) => {
                Plan::Note("not a booking event".into())
            }
        };
        Ok(plan)
    }

    async fn resolve_booking(&self, object: &EventObject) -> EngineResult<Option<BookingKey>> {
        let bookings = self.db.bookings();

        for reference in object.references() {
            if let Some(key) = bookings.find_by_processor_ref(reference).await? {
                return Ok(Some(key));
            }
        }

        if let Some(booking_id) = object
            .metadata_value("idempotency_key")
            .and_then(idempotency::booking_id_of)
        {
            if let Some(key) = bookings.find_key(booking_id).await? {
                return Ok(Some(key));
            }
        }

        match object.metadata_value("booking_id") {
            Some(booking_id) => Ok(bookings.find_key(booking_id).await?),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    async fn note(&self, event_id: &str, note: &str) -> EngineResult<WebhookOutcome> {
        self.db
            .webhooks()
            .mark_processed(event_id, Some(note), Utc::now())
            .await?;
        Ok(WebhookOutcome::Noted(note.to_string()))
    }

    async fn defer(&self, event_id: &str, retry_count: i64, err: &EngineError) -> EngineResult<()> {
        let retries = retry_count + 1;

        if retries >= i64::from(self.settings.max_retries) {
            error!(
                event_id,
                retries,
                error = %err,
                "Webhook event exhausted its retries"
            );
            self.db
                .webhooks()
                .mark_failed(event_id, retries, &err.to_string())
                .await?;
            return Ok(());
        }

        let delay = self.settings.retry_delay(retries as u32);
        let next_retry_at = Utc::now() + Duration::from_std(delay).unwrap_or_else(|_| Duration::hours(1));
        warn!(
            event_id,
            retries,
            %next_retry_at,
            error = %err,
            "Webhook event failed; retry scheduled"
        );
        self.db
            .webhooks()
            .schedule_retry(event_id, retries, next_retry_at, &err.to_string())
            .await?;
        Ok(())
    }
}

/// Errors that waiting will not fix. A missing row may still appear once
/// the matching API call is recorded, so `NotFound` is retried.
fn settles_with_note(err: &EngineError) -> bool {
    match err {
        EngineError::NotFound { .. } => false,
        e => matches!(e.category(), ErrorCategory::Conflict | ErrorCategory::Validation),
    }
}

fn missing(field: &str) -> EngineError {
    EngineError::InvalidPayload(format!("event object has no {}", field))
}

fn refund_completed(refund: &EventObject) -> bool {
    !matches!(refund.status.as_deref(), Some("failed" | "canceled"))
}

fn refund_command(
    booking: &Booking,
    refund: &EventObject,
    parent: Option<&str>,
) -> EngineResult<TransitionCommand> {
    let amount_minor = refund.amount.ok_or_else(|| missing("amount"))?;
    let refunded = refund
        .payment_intent
        .clone()
        .or_else(|| parent.map(str::to_string))
        .or_else(|| refund.charge.clone());

    Ok(TransitionCommand::new(
        &booking.tenant_id,
        &booking.id,
        Intent::Refund { amount_minor },
    )
    .processor_ref(Some(refund.id.clone()))
    .refund_of(refunded)
    .attempt(refund.metadata_value("idempotency_key").map(str::to_string)))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::mock::MockGateway;
    use crate::processor::{ProcessorGateway, RetryPolicy, RetryingGateway};
    use crate::settlement::SettlementService;
    use fleetpay_core::{BookingStatus, DepositStatus, PaymentStatus, TenantAccount, TransferStatus};
    use fleetpay_db::DbConfig;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    const TENANT: &str = "tenant-1";
    const METHOD: &str = "pm_card_visa";

    struct Harness {
        db: Database,
        mock: Arc<MockGateway>,
        settlement: SettlementService,
        reconciler: WebhookReconciler,
        booking: Booking,
    }

    async fn harness_with(webhook: WebhookSettings, policy: Option<RetryPolicy>) -> Harness {
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
        let gateway: Arc<dyn ProcessorGateway> = match policy {
            Some(policy) => Arc::new(RetryingGateway::new(mock.clone(), policy)),
            None => mock.clone(),
        };
        let settings = SettlementSettings::default();
        let settlement = SettlementService::new(db.clone(), gateway.clone(), &settings);
        let connect = ConnectManager::new(db.clone(), gateway);
        let reconciler = WebhookReconciler::new(db.clone(), connect, &webhook, &settings);

        Harness {
            db,
            mock,
            settlement,
            reconciler,
            booking,
        }
    }

    async fn harness() -> Harness {
        harness_with(WebhookSettings::default(), None).await
    }

    fn event(id: &str, event_type: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    async fn stored(h: &Harness, id: &str) -> WebhookEvent {
        h.db.webhooks().get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_charge_once() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let succeeded = event(
            "evt_1",
            "payment_intent.succeeded",
            json!({ "id": "pi_123", "amount": 20000, "amount_received": 20000,
                    "metadata": { "booking_id": id } }),
        );

        assert_eq!(h.reconciler.handle(&succeeded).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(h.reconciler.handle(&succeeded).await.unwrap(), WebhookOutcome::Duplicate);

        // Same movement, different event.
        let charge = event(
            "evt_2",
            "charge.succeeded",
            json!({ "id": "ch_1", "object": "charge", "payment_intent": "pi_123",
                    "amount": 20000, "amount_captured": 20000, "captured": true }),
        );
        assert_eq!(h.reconciler.handle(&charge).await.unwrap(), WebhookOutcome::Duplicate);

        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.charged_minor, 20000);
        assert_eq!(booking.status, BookingStatus::Confirmed);
        let records = h.db.payments().list_for_booking(TENANT, id).await.unwrap();
        assert_eq!(records.len(), 1);

        assert_eq!(stored(&h, "evt_1").await.status, WebhookStatus::Processed);
        assert_eq!(stored(&h, "evt_2").await.status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn test_webhook_confirms_api_charge() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let charged = h.settlement.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        let pi = charged.payment_record.unwrap().processor_ref.unwrap();

        let raw = event(
            "evt_1",
            "payment_intent.succeeded",
            json!({ "id": pi, "amount_received": 20000 }),
        );
        assert_eq!(h.reconciler.handle(&raw).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(stored(&h, "evt_1").await.note.as_deref(), Some("already applied"));
        assert_eq!(h.db.bookings().load(TENANT, id).await.unwrap().charged_minor, 20000);
    }

    #[tokio::test]
    async fn test_webhook_resolves_unknown_attempt() {
        let h = harness_with(
            WebhookSettings::default(),
            Some(RetryPolicy {
                call_timeout: StdDuration::from_millis(50),
                max_attempts: 1,
                initial_backoff: StdDuration::from_millis(1),
                max_backoff: StdDuration::from_millis(1),
            }),
        )
        .await;
        let id = h.booking.id.as_str();
        h.mock.delay_next("charge", StdDuration::from_secs(5));

        let err = h.settlement.charge_booking(TENANT, id, 20000, METHOD).await.unwrap_err();
        let EngineError::OutcomeUnknown { idempotency_key } = err else {
            panic!("expected OutcomeUnknown, got {err}");
        };

        let raw = event(
            "evt_1",
            "payment_intent.succeeded",
            json!({ "id": "pi_live_1", "amount_received": 20000,
                    "metadata": { "idempotency_key": idempotency_key.clone() } }),
        );
        assert_eq!(h.reconciler.handle(&raw).await.unwrap(), WebhookOutcome::Applied);

        let attempt = h.db.attempts().get(&idempotency_key).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Succeeded);
        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.charged_minor, 20000);
        assert_eq!(booking.processor_charge_ref.as_deref(), Some("pi_live_1"));

        let report = h.settlement.reconcile_unknown_attempts().await.unwrap();
        assert_eq!(report.resolved + report.unresolved + report.failed, 0);
    }

    #[tokio::test]
    async fn test_deposit_capture_via_webhook() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let held = h.settlement.authorize_deposit(TENANT, id, 50000, METHOD).await.unwrap();
        let pi = held.booking.deposit.authorization_ref.unwrap();

        let raw = event(
            "evt_1",
            "payment_intent.succeeded",
            json!({ "id": pi, "amount": 50000, "amount_received": 7500 }),
        );
        assert_eq!(h.reconciler.handle(&raw).await.unwrap(), WebhookOutcome::Applied);

        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.deposit.status, DepositStatus::Captured);
        assert_eq!(booking.deposit.captured_minor, 7500);
        assert_eq!(booking.deposit.released_remainder_minor, 42500);

        // A cancel for the captured hold conflicts and is noted, not retried.
        let canceled = event("evt_2", "payment_intent.canceled", json!({ "id": pi }));
        let outcome = h.reconciler.handle(&canceled).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Noted(ref n) if n.starts_with("conflict")));
        assert_eq!(stored(&h, "evt_2").await.status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn test_charge_refunded_lists_each_refund() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let charged = h.settlement.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        let pi = charged.payment_record.unwrap().processor_ref.unwrap();

        let refunded = |evt: &str| {
            event(
                evt,
                "charge.refunded",
                json!({ "id": "ch_1", "object": "charge", "payment_intent": pi,
                        "amount": 20000, "amount_captured": 20000, "captured": true,
                        "refunds": { "data": [
                            { "id": "re_1", "amount": 2500, "status": "succeeded" },
                            { "id": "re_2", "amount": 1000, "status": "succeeded" },
                            { "id": "re_3", "amount": 9000, "status": "failed" }
                        ] } }),
            )
        };

        assert_eq!(h.reconciler.handle(&refunded("evt_1")).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(h.reconciler.handle(&refunded("evt_2")).await.unwrap(), WebhookOutcome::Duplicate);

        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.refunded_minor, 3500);
        assert_eq!(h.db.payments().refunded_against(TENANT, &pi).await.unwrap(), 3500);
    }

    #[tokio::test]
    async fn test_unmatched_and_ignored_events_are_noted() {
        let h = harness().await;

        let unmatched = event("evt_1", "payment_intent.succeeded", json!({ "id": "pi_elsewhere", "amount": 100 }));
        assert_eq!(
            h.reconciler.handle(&unmatched).await.unwrap(),
            WebhookOutcome::Noted("no matching booking".into())
        );

        let ignored = event("evt_2", "customer.created", json!({ "id": "cus_1" }));
        assert_eq!(
            h.reconciler.handle(&ignored).await.unwrap(),
            WebhookOutcome::Noted("ignored event type".into())
        );
        assert_eq!(stored(&h, "evt_2").await.status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let h = harness().await;
        let err = h.reconciler.handle(b"{not json").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_payment_failed_marks_attempt() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let key = idempotency::charge_key(&h.booking, 20000);
        let now = Utc::now();
        h.db.attempts()
            .begin(&fleetpay_core::SettlementAttempt {
                idempotency_key: key.clone(),
                booking_id: id.to_string(),
                tenant_id: TENANT.into(),
                intent: AttemptIntent::Charge,
                amount_minor: 20000,
                currency: "USD".into(),
                status: AttemptStatus::Unknown,
                target_ref: None,
                processor_ref: None,
                payment_method_ref: None,
                reason: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let raw = event(
            "evt_1",
            "payment_intent.payment_failed",
            json!({ "id": "pi_9", "amount": 20000,
                    "last_payment_error": { "code": "card_declined", "decline_code": "insufficient_funds" },
                    "metadata": { "idempotency_key": key.clone() } }),
        );
        assert_eq!(h.reconciler.handle(&raw).await.unwrap(), WebhookOutcome::Applied);

        let attempt = h.db.attempts().get(&key).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        let records = h.db.payments().list_for_booking(TENANT, id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PaymentStatus::Failed);
        assert!(records[0].reason.as_deref().unwrap().starts_with("insufficient_funds"));

        // Redelivered under a new event id: nothing new is written.
        let again = event(
            "evt_2",
            "payment_intent.payment_failed",
            json!({ "id": "pi_9", "amount": 20000, "metadata": { "idempotency_key": key } }),
        );
        assert!(matches!(h.reconciler.handle(&again).await.unwrap(), WebhookOutcome::Noted(_)));
        assert_eq!(h.db.payments().list_for_booking(TENANT, id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_early_transfer_event_is_retried() {
        let h = harness_with(
            WebhookSettings {
                initial_retry_secs: 0,
                ..Default::default()
            },
            None,
        )
        .await;
        let id = h.booking.id.as_str();

        // Mock ids are sequential: charge gets pi_mock_0, transfer tr_mock_1.
        let paid = event("evt_1", "transfer.paid", json!({ "id": "tr_mock_1" }));
        assert_eq!(h.reconciler.handle(&paid).await.unwrap(), WebhookOutcome::Deferred);
        let pending = stored(&h, "evt_1").await;
        assert_eq!(pending.status, WebhookStatus::Pending);
        assert_eq!(pending.retry_count, 1);
        assert!(pending.next_retry_at.is_some());

        h.settlement.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        let transferred = h.settlement.transfer_to_tenant(TENANT, id).await.unwrap();
        assert_eq!(
            transferred.transfer.unwrap().processor_transfer_id.as_deref(),
            Some("tr_mock_1")
        );

        let report = h.reconciler.retry_due().await.unwrap();
        assert_eq!(report, RetryReport { settled: 1, deferred: 0 });

        let transfer = h.db.transfers().get_for_booking(TENANT, id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Paid);
        assert_eq!(stored(&h, "evt_1").await.status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn test_exhausted_event_waits_for_replay() {
        let h = harness_with(
            WebhookSettings {
                max_retries: 1,
                ..Default::default()
            },
            None,
        )
        .await;
        let id = h.booking.id.as_str();

        let paid = event("evt_1", "transfer.paid", json!({ "id": "tr_mock_1" }));
        assert_eq!(h.reconciler.handle(&paid).await.unwrap(), WebhookOutcome::Deferred);

        let failed = h.reconciler.failed_events(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "evt_1");
        assert!(failed[0].error_message.is_some());

        // Redelivery leaves it for the operator.
        assert_eq!(h.reconciler.handle(&paid).await.unwrap(), WebhookOutcome::Deferred);

        h.settlement.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        h.settlement.transfer_to_tenant(TENANT, id).await.unwrap();

        assert_eq!(h.reconciler.replay("evt_1").await.unwrap(), WebhookOutcome::Applied);
        assert!(h.reconciler.failed_events(10).await.unwrap().is_empty());
        assert_eq!(h.reconciler.replay("evt_1").await.unwrap(), WebhookOutcome::Duplicate);
        assert!(matches!(
            h.reconciler.replay("evt_missing").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_account_updated_syncs_tenant() {
        let h = harness().await;
        let raw = event(
            "evt_1",
            "account.updated",
            json!({ "id": "acct_1", "charges_enabled": true, "payouts_enabled": true,
                    "details_submitted": true,
                    "requirements": { "past_due": ["external_account"] } }),
        );
        assert_eq!(h.reconciler.handle(&raw).await.unwrap(), WebhookOutcome::Applied);

        let account = h.db.tenants().load(TENANT).await.unwrap();
        assert_eq!(account.requirements_past_due, vec!["external_account".to_string()]);
        assert!(!fleetpay_core::account::can_accept_charges(&account));
        assert_eq!(stored(&h, "evt_1").await.status, WebhookStatus::Processed);

        let foreign = event("evt_2", "account.updated", json!({ "id": "acct_other" }));
        assert!(matches!(h.reconciler.handle(&foreign).await.unwrap(), WebhookOutcome::Noted(_)));
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_events() {
        let h = harness().await;
        let ignored = event("evt_1", "customer.created", json!({ "id": "cus_1" }));
        h.reconciler.handle(&ignored).await.unwrap();

        let purged = h
            .reconciler
            .purge_processed_before(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        let purged = h
            .reconciler
            .purge_processed_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
