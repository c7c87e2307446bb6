//! # Settlement Service
//!
//! Caller-initiated money movements for one booking.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. validate input                                                     │
//! │  2. load booking, gate on the tenant account                           │
//! │  3. dry-run the transition ──── already applied ──► return, no call    │
//! │  4. derive idempotency key (+ /rN after declines)                      │
//! │  5. journal attempt (in_flight) ─── booking unsettled ────► Conflict   │
//! │  6. processor call                                                     │
//! │       ├── ok ──────────► ledger: transition + record + attempt, 1 tx   │
//! │       ├── declined ────► attempt failed (+ failed ledger entry)        │
//! │       └── timeout ─────► attempt unknown ──► OutcomeUnknown            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An `unknown` attempt is settled by the matching webhook or by
//! [`SettlementService::reconcile_unknown_attempts`], which re-issues the
//! call under the same key. The processor collapses the repeat into the
//! original operation, and the ledger deduplicates on its reference.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SettlementSettings;
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::processor::{
    booking_metadata, CaptureMode, CaptureRequest, ChargeRequest, PaymentIntent, ProcessorError,
    ProcessorGateway, RefundRequest, ReleaseRequest, TransferRequest,
};
use fleetpay_core::account;
use fleetpay_core::idempotency;
use fleetpay_core::state_machine;
use fleetpay_core::validation::{validate_amount_minor, validate_id, validate_reason};
use fleetpay_core::{
    AttemptIntent, AttemptStatus, Booking, BookingStatus, FeeRate, Intent, Money, Movement,
    Outcome, PaymentStatus, PaymentType, SettlementAttempt, TransitionContext, TransitionError,
    ValidationError,
};
use fleetpay_db::ledger::{self, Applied, TransitionCommand};
use fleetpay_db::{BeginAttempt, Database};

// =============================================================================
// Processor Calls
// =============================================================================

/// One processor call and everything needed to record its result.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Authorize {
        amount_minor: i64,
        payment_method: String,
        on_behalf_of: Option<String>,
    },
    Capture {
        authorization_ref: String,
        amount_minor: i64,
        reason: Option<String>,
    },
    Release {
        authorization_ref: String,
        held_minor: i64,
        reason: Option<String>,
    },
    Charge {
        amount_minor: i64,
        payment_method: String,
        on_behalf_of: Option<String>,
    },
    Refund {
        payment_intent_id: String,
        amount_minor: i64,
        reason: Option<String>,
    },
    Transfer {
        destination: String,
        fee_rate: FeeRate,
        net_minor: i64,
    },
}

impl Call {
    fn intent(&self) -> AttemptIntent {
        match self {
            Call::Authorize { .. } => AttemptIntent::AuthorizeDeposit,
            Call::Capture { .. } => AttemptIntent::CaptureDeposit,
            Call::Release { .. } => AttemptIntent::ReleaseDeposit,
            Call::Charge { .. } => AttemptIntent::Charge,
            Call::Refund { .. } => AttemptIntent::Refund,
            Call::Transfer { .. } => AttemptIntent::Transfer,
        }
    }

    fn amount_minor(&self) -> i64 {
        match self {
            Call::Authorize { amount_minor, .. }
            | Call::Capture { amount_minor, .. }
            | Call::Charge { amount_minor, .. }
            | Call::Refund { amount_minor, .. } => *amount_minor,
            Call::Release { held_minor, .. } => *held_minor,
            Call::Transfer { net_minor, .. } => *net_minor,
        }
    }

    fn money(&self, currency: &str) -> Money {
        Money::new(self.amount_minor(), currency)
    }

    /// The processor object the call acts on.
    fn target_ref(&self) -> Option<String> {
        match self {
            Call::Capture {
                authorization_ref, ..
            }
            | Call::Release {
                authorization_ref, ..
            } => Some(authorization_ref.clone()),
            Call::Refund {
                payment_intent_id, ..
            } => Some(payment_intent_id.clone()),
            Call::Transfer { destination, .. } => Some(destination.clone()),
            Call::Authorize { .. } | Call::Charge { .. } => None,
        }
    }

    fn payment_method(&self) -> Option<String> {
        match self {
            Call::Authorize { payment_method, .. } | Call::Charge { payment_method, .. } => {
                Some(payment_method.clone())
            }
            _ => None,
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Call::Capture { reason, .. }
            | Call::Release { reason, .. }
            | Call::Refund { reason, .. } => reason.clone(),
            _ => None,
        }
    }

    /// Ledger entry written when the customer's card declines.
    fn failure_entry(&self) -> Option<(PaymentType, i64)> {
        match self {
            Call::Authorize { amount_minor, .. } => Some((PaymentType::Deposit, *amount_minor)),
            Call::Charge { amount_minor, .. } => Some((PaymentType::FullPayment, *amount_minor)),
            _ => None,
        }
    }
}

enum Journal {
    /// Make the call under this key.
    Run(String),
    /// Repeat the call as journaled; the outcome of the first is unknown.
    Resume(SettlementAttempt),
    /// Nothing left to do.
    Done(Applied),
}

/// Result of one [`SettlementService::reconcile_unknown_attempts`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Confirmed and recorded.
    pub resolved: usize,
    /// Definitively failed.
    pub failed: usize,
    /// Still unknown; retried on the next pass.
    pub unresolved: usize,
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct SettlementService {
    db: Database,
    gateway: Arc<dyn ProcessorGateway>,
    hold_window: Duration,
    in_flight_timeout: Duration,
    reconcile_batch_size: u32,
}

impl SettlementService {
    pub fn new(db: Database, gateway: Arc<dyn ProcessorGateway>, settings: &SettlementSettings) -> Self {
        SettlementService {
            db,
            gateway,
            hold_window: settings.hold_window(),
            in_flight_timeout: Duration::seconds(settings.in_flight_timeout_secs as i64),
            reconcile_batch_size: settings.reconcile_batch_size,
        }
    }

    fn context(&self) -> TransitionContext {
        TransitionContext::new(Utc::now(), self.hold_window)
    }

    // =========================================================================
    // Security Deposit
    // =========================================================================

    /// Places a hold of `amount_minor` on the customer's payment method
    /// `payment_method_ref`.
    pub async fn authorize_deposit(
        &self,
        tenant_id: &str,
        booking_id: &str,
        amount_minor: i64,
        payment_method_ref: &str,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        validate_amount_minor(amount_minor)?;
        validate_id("payment_method_ref", payment_method_ref)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let on_behalf_of = self.charge_account(tenant_id).await?;

        let intent = Intent::AuthorizeDeposit {
            amount_minor,
            authorization_ref: None,
        };
        if let Some(done) = self.dry_run(&booking, &intent)? {
            return Ok(done);
        }

        let call = Call::Authorize {
            amount_minor,
            payment_method: payment_method_ref.trim().to_string(),
            on_behalf_of: Some(on_behalf_of),
        };
        self.run(&booking, call, idempotency::authorize_key(&booking))
            .await
    }

    /// Captures `amount_minor` of the hold; the rest is released.
    pub async fn capture_deposit(
        &self,
        tenant_id: &str,
        booking_id: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        validate_amount_minor(amount_minor)?;
        let reason = validate_reason(reason)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let intent = Intent::CaptureDeposit {
            amount_minor,
            reason: reason.clone(),
        };
        if let Some(done) = self.dry_run(&booking, &intent)? {
            return Ok(done);
        }

        let call = Call::Capture {
            authorization_ref: authorization_ref(&booking)?,
            amount_minor,
            reason,
        };
        self.run(&booking, call, idempotency::capture_key(&booking))
            .await
    }

    /// Cancels the hold.
    pub async fn release_deposit(
        &self,
        tenant_id: &str,
        booking_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        let reason = validate_reason(reason)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let intent = Intent::ReleaseDeposit {
            reason: reason.clone(),
        };
        if let Some(done) = self.dry_run(&booking, &intent)? {
            return Ok(done);
        }

        let call = Call::Release {
            authorization_ref: authorization_ref(&booking)?,
            held_minor: booking.deposit.authorized_minor,
            reason,
        };
        self.run(&booking, call, idempotency::release_key(&booking))
            .await
    }

    // =========================================================================
    // Rental Charges
    // =========================================================================

    /// Charges `amount_minor` of the rental price to `payment_method_ref`.
    pub async fn charge_booking(
        &self,
        tenant_id: &str,
        booking_id: &str,
        amount_minor: i64,
        payment_method_ref: &str,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        validate_amount_minor(amount_minor)?;
        validate_id("payment_method_ref", payment_method_ref)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let on_behalf_of = self.charge_account(tenant_id).await?;

        let intent = Intent::Charge {
            amount_minor,
            charge_ref: None,
        };
        if let Some(done) = self.dry_run(&booking, &intent)? {
            return Ok(done);
        }

        let call = Call::Charge {
            amount_minor,
            payment_method: payment_method_ref.trim().to_string(),
            on_behalf_of: Some(on_behalf_of),
        };
        self.run(&booking, call, idempotency::charge_key(&booking, amount_minor))
            .await
    }

    /// Refunds `amount_minor` of the ledger entry `payment_id`.
    pub async fn refund_payment(
        &self,
        tenant_id: &str,
        booking_id: &str,
        payment_id: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        validate_id("payment_id", payment_id)?;
        validate_amount_minor(amount_minor)?;
        let reason = validate_reason(reason)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let record = self
            .db
            .payments()
            .get(tenant_id, payment_id)
            .await?
            .ok_or_else(|| EngineError::not_found("PaymentRecord", payment_id))?;

        if record.booking_id.as_deref() != Some(booking_id) {
            return Err(invalid_payment("belongs to another booking").into());
        }
        let refundable_type = matches!(
            record.payment_type,
            PaymentType::FullPayment | PaymentType::Deposit
        );
        if !refundable_type || record.status != PaymentStatus::Succeeded {
            return Err(invalid_payment("is not a successful charge").into());
        }
        let payment_intent_id = record
            .processor_ref
            .clone()
            .ok_or_else(|| invalid_payment("has no processor reference"))?;

        let already = self
            .db
            .payments()
            .refunded_against(tenant_id, &payment_intent_id)
            .await?;
        let refundable = record.amount_minor - already;
        if amount_minor > refundable {
            return Err(TransitionError::RefundExceedsCharged {
                requested: amount_minor,
                refundable,
            }
            .into());
        }

        self.dry_run(&booking, &Intent::Refund { amount_minor })?;

        let call = Call::Refund {
            payment_intent_id,
            amount_minor,
            reason,
        };
        self.run(
            &booking,
            call,
            idempotency::refund_key(&booking, payment_id, amount_minor),
        )
        .await
    }

    // =========================================================================
    // Payouts
    // =========================================================================

    /// Pays the booking's collected funds, minus the platform fee, out to
    /// the tenant's sub-account.
    pub async fn transfer_to_tenant(&self, tenant_id: &str, booking_id: &str) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;

        let booking = ledger::load_booking(&self.db, tenant_id, booking_id).await?;
        let account = self
            .db
            .tenants()
            .get(tenant_id)
            .await?
            .filter(account::can_receive_payouts)
            .ok_or_else(|| EngineError::PayoutsDisabled(tenant_id.to_string()))?;
        let destination = account
            .processor_account_id
            .clone()
            .ok_or_else(|| EngineError::PayoutsDisabled(tenant_id.to_string()))?;

        // Read at transfer time so a fee change applies to the next payout.
        let fee_rate = FeeRate::from_bps(account.platform_fee_bps)?;
        let intent = Intent::Transfer {
            fee_rate,
            transfer_ref: None,
        };
        let transition = state_machine::apply(&booking, &intent, &self.context())?;
        let net_minor = match transition.movement {
            Some(Movement::Transfer { net_minor, .. }) if transition.is_applied() => net_minor,
            _ => return Ok(unchanged(&booking)),
        };

        let call = Call::Transfer {
            destination,
            fee_rate,
            net_minor,
        };
        self.run(&booking, call, idempotency::transfer_key(&booking))
            .await
    }

    // =========================================================================
    // Booking Lifecycle
    // =========================================================================

    /// Moves the rental itself along (pick-up, return, cancellation).
    pub async fn advance_booking(
        &self,
        tenant_id: &str,
        booking_id: &str,
        to: BookingStatus,
    ) -> EngineResult<Applied> {
        validate_ids(tenant_id, booking_id)?;
        let cmd = TransitionCommand::new(tenant_id, booking_id, Intent::Advance { to });
        Ok(ledger::apply_transition(&self.db, &cmd, &self.context()).await?)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Re-issues calls whose outcome is unknown, plus in-flight calls whose
    /// caller went away, under their original keys.
    pub async fn reconcile_unknown_attempts(&self) -> EngineResult<ReconcileReport> {
        let stale_before = Utc::now() - self.in_flight_timeout;
        let attempts = self
            .db
            .attempts()
            .list_unresolved(stale_before, self.reconcile_batch_size)
            .await?;

        let mut report = ReconcileReport::default();
        for attempt in attempts {
            match self.resume(&attempt).await {
                Ok(_) => report.resolved += 1,
                Err(e) if matches!(e.category(), ErrorCategory::Unknown | ErrorCategory::Transient) => {
                    debug!(
                        idempotency_key = %attempt.idempotency_key,
                        error = %e,
                        "Attempt still unresolved"
                    );
                    report.unresolved += 1;
                }
                Err(e) => {
                    warn!(
                        idempotency_key = %attempt.idempotency_key,
                        error = %e,
                        "Attempt failed during reconciliation"
                    );
                    report.failed += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                resolved = report.resolved,
                failed = report.failed,
                unresolved = report.unresolved,
                "Reconciled unknown attempts"
            );
        }
        Ok(report)
    }

    async fn resume(&self, attempt: &SettlementAttempt) -> EngineResult<Applied> {
        let key = attempt.idempotency_key.as_str();
        let booking = ledger::load_booking(&self.db, &attempt.tenant_id, &attempt.booking_id).await?;
        let Some(call) = self.call_for(&booking, attempt).await? else {
            return Err(EngineError::OutcomeUnknown {
                idempotency_key: key.to_string(),
            });
        };

        debug!(idempotency_key = key, intent = attempt.intent.as_str(), "Re-issuing attempt");
        match self.execute(&booking, &call, key).await {
            Err(EngineError::Transition(e)) => {
                // The processor holds money the booking state cannot take.
                error!(
                    idempotency_key = key,
                    booking_id = %booking.id,
                    error = %e,
                    "Ledger rejected a processor-confirmed attempt"
                );
                self.db
                    .attempts()
                    .mark_failed(key, &format!("ledger rejected: {}", e), Utc::now())
                    .await?;
                Err(EngineError::Transition(e))
            }
            other => other,
        }
    }

    /// Rebuilds the call an attempt journaled. `None` when it can no longer
    /// be repeated safely.
    async fn call_for(&self, booking: &Booking, attempt: &SettlementAttempt) -> EngineResult<Option<Call>> {
        let target = || {
            attempt.target_ref.clone().ok_or_else(|| {
                EngineError::Internal(format!("attempt {} has no target", attempt.idempotency_key))
            })
        };
        let payment_method = || {
            attempt.payment_method_ref.clone().ok_or_else(|| {
                EngineError::Internal(format!(
                    "attempt {} has no payment method",
                    attempt.idempotency_key
                ))
            })
        };

        let call = match attempt.intent {
            AttemptIntent::AuthorizeDeposit => Call::Authorize {
                amount_minor: attempt.amount_minor,
                payment_method: payment_method()?,
                on_behalf_of: self.sub_account(&attempt.tenant_id).await?,
            },
            AttemptIntent::CaptureDeposit => Call::Capture {
                authorization_ref: target()?,
                amount_minor: attempt.amount_minor,
                reason: attempt.reason.clone(),
            },
            AttemptIntent::ReleaseDeposit => Call::Release {
                authorization_ref: target()?,
                held_minor: attempt.amount_minor,
                reason: attempt.reason.clone(),
            },
            AttemptIntent::Charge => Call::Charge {
                amount_minor: attempt.amount_minor,
                payment_method: payment_method()?,
                on_behalf_of: self.sub_account(&attempt.tenant_id).await?,
            },
            AttemptIntent::Refund => Call::Refund {
                payment_intent_id: target()?,
                amount_minor: attempt.amount_minor,
                reason: attempt.reason.clone(),
            },
            AttemptIntent::Transfer => {
                let account = self.db.tenants().load(&attempt.tenant_id).await?;
                let fee_rate = FeeRate::from_bps(account.platform_fee_bps)?;
                let transition = state_machine::apply(
                    booking,
                    &Intent::Transfer {
                        fee_rate,
                        transfer_ref: None,
                    },
                    &self.context(),
                )?;
                if let Some(Movement::Transfer { net_minor, .. }) = transition.movement {
                    if net_minor != attempt.amount_minor {
                        warn!(
                            idempotency_key = %attempt.idempotency_key,
                            journaled = attempt.amount_minor,
                            current = net_minor,
                            "Transfer amount changed since the call; leaving attempt unknown"
                        );
                        return Ok(None);
                    }
                }
                Call::Transfer {
                    destination: target()?,
                    fee_rate,
                    net_minor: attempt.amount_minor,
                }
            }
        };
        Ok(Some(call))
    }

    // =========================================================================
    // Shared Steps
    // =========================================================================

    fn dry_run(&self, booking: &Booking, intent: &Intent) -> EngineResult<Option<Applied>> {
        let transition = state_machine::apply(booking, intent, &self.context())?;
        if transition.is_applied() {
            Ok(None)
        } else {
            debug!(booking_id = %booking.id, intent = intent.label(), "Already applied, no call");
            Ok(Some(unchanged(booking)))
        }
    }

    /// The tenant's sub-account, if charges are allowed.
    async fn charge_account(&self, tenant_id: &str) -> EngineResult<String> {
        let account = self.db.tenants().get(tenant_id).await?;
        match account {
            Some(a) if account::can_accept_charges(&a) => a
                .processor_account_id
                .ok_or_else(|| EngineError::ChargesDisabled(tenant_id.to_string())),
            _ => {
                warn!(tenant_id, "Tenant cannot accept charges");
                Err(EngineError::ChargesDisabled(tenant_id.to_string()))
            }
        }
    }

    async fn sub_account(&self, tenant_id: &str) -> EngineResult<Option<String>> {
        Ok(self
            .db
            .tenants()
            .get(tenant_id)
            .await?
            .and_then(|a| a.processor_account_id))
    }

    async fn run(&self, booking: &Booking, call: Call, base_key: String) -> EngineResult<Applied> {
        match self.journal(booking, &call, &base_key).await? {
            Journal::Run(key) => self.execute(booking, &call, &key).await,
            Journal::Resume(attempt) => self.resume(&attempt).await,
            Journal::Done(applied) => Ok(applied),
        }
    }

    /// Persists the attempt before the call.
    async fn journal(&self, booking: &Booking, call: &Call, base_key: &str) -> EngineResult<Journal> {
        // A declined key replays its decline at the processor, so every
        // decline moves the next try to a fresh suffix.
        let failed = self.db.attempts().count_failed(base_key).await?;
        let key = if failed == 0 {
            base_key.to_string()
        } else {
            format!("{}/r{}", base_key, failed)
        };

        let now = Utc::now();
        let attempt = SettlementAttempt {
            idempotency_key: key.clone(),
            booking_id: booking.id.clone(),
            tenant_id: booking.tenant_id.clone(),
            intent: call.intent(),
            amount_minor: call.amount_minor(),
            currency: booking.currency.clone(),
            status: AttemptStatus::InFlight,
            target_ref: call.target_ref(),
            processor_ref: None,
            payment_method_ref: call.payment_method(),
            reason: call.reason(),
            error: None,
            created_at: now,
            updated_at: now,
        };

        match self.db.attempts().begin(&attempt).await? {
            BeginAttempt::Started => Ok(Journal::Run(key)),
            BeginAttempt::Existing(existing) => match existing.status {
                AttemptStatus::Unknown => {
                    info!(idempotency_key = %key, "Resuming attempt with unknown outcome");
                    Ok(Journal::Resume(existing))
                }
                AttemptStatus::Succeeded => Ok(Journal::Done(unchanged(booking))),
                AttemptStatus::InFlight => Err(EngineError::Conflict(format!(
                    "{} is already in flight",
                    key
                ))),
                AttemptStatus::Failed => Err(EngineError::Conflict(format!(
                    "{} failed concurrently; retry",
                    key
                ))),
            },
            BeginAttempt::Blocked(pending) => {
                // The pending call may still land; a new key next to it
                // could move the same money twice.
                warn!(
                    idempotency_key = %key,
                    pending = %pending.idempotency_key,
                    status = pending.status.as_str(),
                    amount = %call.money(&booking.currency),
                    "Refusing call while another attempt is unsettled"
                );
                Err(EngineError::Conflict(format!(
                    "booking {} has unsettled attempt {} ({})",
                    booking.id,
                    pending.idempotency_key,
                    pending.status.as_str()
                )))
            }
        }
    }

    /// Makes the call and records its result.
    async fn execute(&self, booking: &Booking, call: &Call, key: &str) -> EngineResult<Applied> {
        let cmd = match self.invoke(booking, call, key).await {
            Ok(cmd) => cmd,
            Err(err) => return Err(self.record_failure(booking, call, key, err).await),
        };

        match ledger::apply_transition(&self.db, &cmd, &self.context()).await {
            Ok(applied) => {
                info!(
                    idempotency_key = key,
                    booking_id = %booking.id,
                    intent = call.intent().as_str(),
                    amount = %call.money(&booking.currency),
                    "Settlement call recorded"
                );
                Ok(applied)
            }
            Err(err) => {
                error!(
                    idempotency_key = key,
                    booking_id = %booking.id,
                    error = %err,
                    "Processor confirmed but the ledger write failed"
                );
                if let Err(e) = self
                    .db
                    .attempts()
                    .mark_unknown(key, &err.to_string(), Utc::now())
                    .await
                {
                    error!(idempotency_key = key, error = %e, "Could not mark attempt unknown");
                }
                Err(err.into())
            }
        }
    }

    async fn invoke(
        &self,
        booking: &Booking,
        call: &Call,
        key: &str,
    ) -> Result<TransitionCommand, ProcessorError> {
        let metadata = booking_metadata(&booking.tenant_id, &booking.id, key);
        let command = |intent: Intent| {
            TransitionCommand::new(&booking.tenant_id, &booking.id, intent)
                .attempt(Some(key.to_string()))
        };

        match call {
            Call::Authorize {
                amount_minor,
                payment_method,
                on_behalf_of,
            } => {
                let pi = self
                    .gateway
                    .charge(&ChargeRequest {
                        idempotency_key: key.to_string(),
                        amount_minor: *amount_minor,
                        currency: booking.currency.clone(),
                        customer_id: booking.customer_id.clone(),
                        payment_method: payment_method.clone(),
                        capture_mode: CaptureMode::Manual,
                        on_behalf_of: on_behalf_of.clone(),
                        metadata,
                    })
                    .await?;
                expect_status(&pi, "requires_capture")?;
                Ok(command(Intent::AuthorizeDeposit {
                    amount_minor: *amount_minor,
                    authorization_ref: Some(pi.id),
                }))
            }
            Call::Capture {
                authorization_ref,
                amount_minor,
                reason,
            } => {
                let pi = self
                    .gateway
                    .capture(&CaptureRequest {
                        idempotency_key: key.to_string(),
                        payment_intent_id: authorization_ref.clone(),
                        amount_minor: *amount_minor,
                    })
                    .await?;
                expect_status(&pi, "succeeded")?;
                Ok(command(Intent::CaptureDeposit {
                    amount_minor: *amount_minor,
                    reason: reason.clone(),
                })
                .processor_ref(Some(pi.id))
                .reason(reason.clone()))
            }
            Call::Release {
                authorization_ref,
                reason,
                ..
            } => {
                let pi = self
                    .gateway
                    .release(&ReleaseRequest {
                        idempotency_key: key.to_string(),
                        payment_intent_id: authorization_ref.clone(),
                    })
                    .await?;
                expect_status(&pi, "canceled")?;
                Ok(command(Intent::ReleaseDeposit {
                    reason: reason.clone(),
                })
                .reason(reason.clone()))
            }
            Call::Charge {
                amount_minor,
                payment_method,
                on_behalf_of,
            } => {
                let pi = self
                    .gateway
                    .charge(&ChargeRequest {
                        idempotency_key: key.to_string(),
                        amount_minor: *amount_minor,
                        currency: booking.currency.clone(),
                        customer_id: booking.customer_id.clone(),
                        payment_method: payment_method.clone(),
                        capture_mode: CaptureMode::Automatic,
                        on_behalf_of: on_behalf_of.clone(),
                        metadata,
                    })
                    .await?;
                expect_status(&pi, "succeeded")?;
                Ok(command(Intent::Charge {
                    amount_minor: *amount_minor,
                    charge_ref: Some(pi.id.clone()),
                })
                .processor_ref(Some(pi.id)))
            }
            Call::Refund {
                payment_intent_id,
                amount_minor,
                reason,
            } => {
                let refund = self
                    .gateway
                    .refund(&RefundRequest {
                        idempotency_key: key.to_string(),
                        payment_intent_id: payment_intent_id.clone(),
                        amount_minor: *amount_minor,
                        metadata,
                    })
                    .await?;
                if matches!(refund.status.as_str(), "failed" | "canceled") {
                    return Err(ProcessorError::InvalidRequest(format!(
                        "refund {} is {}",
                        refund.id, refund.status
                    )));
                }
                Ok(command(Intent::Refund {
                    amount_minor: *amount_minor,
                })
                .processor_ref(Some(refund.id))
                .refund_of(Some(payment_intent_id.clone()))
                .reason(reason.clone()))
            }
            Call::Transfer {
                destination,
                fee_rate,
                net_minor,
            } => {
                let receipt = self
                    .gateway
                    .transfer(&TransferRequest {
                        idempotency_key: key.to_string(),
                        amount_minor: *net_minor,
                        currency: booking.currency.clone(),
                        destination: destination.clone(),
                        metadata,
                    })
                    .await?;
                Ok(command(Intent::Transfer {
                    fee_rate: *fee_rate,
                    transfer_ref: Some(receipt.id.clone()),
                })
                .processor_ref(Some(receipt.id))
                .destination(destination.clone(), receipt.status))
            }
        }
    }

    /// Classifies a failed call, updates the attempt, and returns the
    /// caller-facing error.
    async fn record_failure(
        &self,
        booking: &Booking,
        call: &Call,
        key: &str,
        err: ProcessorError,
    ) -> EngineError {
        let now = Utc::now();

        if err.is_ambiguous() {
            warn!(
                idempotency_key = key,
                booking_id = %booking.id,
                amount = %call.money(&booking.currency),
                error = %err,
                "Processor outcome unknown"
            );
            if let Err(e) = self.db.attempts().mark_unknown(key, &err.to_string(), now).await {
                return e.into();
            }
            return match err {
                ProcessorError::Unavailable(_) => EngineError::Processor(err),
                _ => EngineError::OutcomeUnknown {
                    idempotency_key: key.to_string(),
                },
            };
        }

        info!(
            idempotency_key = key,
            booking_id = %booking.id,
            amount = %call.money(&booking.currency),
            error = %err,
            "Processor refused the call"
        );
        if let Err(e) = self.db.attempts().mark_failed(key, &err.to_string(), now).await {
            return e.into();
        }

        if err.is_decline() {
            if let Some((payment_type, amount_minor)) = call.failure_entry() {
                // Not tied to the attempt: it is already failed.
                let cmd = TransitionCommand::new(
                    &booking.tenant_id,
                    &booking.id,
                    Intent::RecordFailure {
                        payment_type,
                        amount_minor,
                    },
                )
                .reason(Some(err.to_string()));
                if let Err(e) = ledger::apply_transition(&self.db, &cmd, &self.context()).await {
                    warn!(booking_id = %booking.id, error = %e, "Could not record declined payment");
                }
            }
        }

        EngineError::Processor(err)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_ids(tenant_id: &str, booking_id: &str) -> Result<(), ValidationError> {
    validate_id("tenant_id", tenant_id)?;
    validate_id("booking_id", booking_id)
}

fn invalid_payment(reason: &str) -> ValidationError {
    ValidationError::InvalidFormat {
        field: "payment_id".into(),
        reason: reason.into(),
    }
}

fn authorization_ref(booking: &Booking) -> EngineResult<String> {
    booking.deposit.authorization_ref.clone().ok_or_else(|| {
        EngineError::Conflict(format!("deposit of {} has no authorization", booking.id))
    })
}

fn unchanged(booking: &Booking) -> Applied {
    Applied {
        booking: booking.clone(),
        outcome: Outcome::AlreadyApplied,
        payment_record: None,
        transfer: None,
    }
}

/// Checks that a payment intent ended where the call should leave it.
fn expect_status(pi: &PaymentIntent, expected: &str) -> Result<(), ProcessorError> {
    match pi.status.as_str() {
        s if s == expected => Ok(()),
        "requires_payment_method" | "canceled" => Err(ProcessorError::CardDeclined {
            code: pi.status.clone(),
            message: format!("payment intent {} is {}", pi.id, pi.status),
        }),
        _ => Err(ProcessorError::MalformedResponse(format!(
            "payment intent {} is {}, expected {}",
            pi.id, pi.status, expected
        ))),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::mock::MockGateway;
    use crate::processor::{RetryPolicy, RetryingGateway};
    use fleetpay_core::{DepositStatus, TenantAccount, TransferStatus};
    use fleetpay_db::DbConfig;
    use std::time::Duration as StdDuration;

    const TENANT: &str = "tenant-1";
    const METHOD: &str = "pm_card_visa";

    struct Harness {
        db: Database,
        mock: Arc<MockGateway>,
        service: SettlementService,
        booking: Booking,
    }

    async fn harness_with(policy: Option<RetryPolicy>) -> Harness {
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
        let service = SettlementService::new(db.clone(), gateway, &SettlementSettings::default());

        Harness {
            db,
            mock,
            service,
            booking,
        }
    }

    async fn harness() -> Harness {
        harness_with(None).await
    }

    #[tokio::test]
    async fn test_fuel_capture_on_500_deposit() {
        let h = harness().await;
        let id = h.booking.id.as_str();

        let held = h.service.authorize_deposit(TENANT, id, 50000, METHOD).await.unwrap();
        assert_eq!(held.outcome, Outcome::Applied);
        assert_eq!(held.booking.deposit.status, DepositStatus::Authorized);
        let auth_ref = held.booking.deposit.authorization_ref.clone().unwrap();

        let captured = h
            .service
            .capture_deposit(TENANT, id, 7500, Some("fuel"))
            .await
            .unwrap();
        assert_eq!(captured.booking.deposit.status, DepositStatus::Captured);
        assert_eq!(captured.booking.deposit.captured_minor, 7500);
        assert_eq!(captured.booking.deposit.released_remainder_minor, 42500);

        let record = captured.payment_record.unwrap();
        assert_eq!(record.payment_type, PaymentType::Deposit);
        assert_eq!(record.amount_minor, 7500);
        assert_eq!(record.processor_ref.as_deref(), Some(auth_ref.as_str()));
        assert_eq!(record.reason.as_deref(), Some("fuel"));

        // Release after capture is refused before any processor call.
        let err = h.service.release_deposit(TENANT, id, None).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(h.mock.calls("release"), 0);

        // Repeating the capture is a no-op.
        let again = h
            .service
            .capture_deposit(TENANT, id, 7500, Some("fuel"))
            .await
            .unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
        assert_eq!(h.mock.calls("capture"), 1);

        let attempts = h.db.attempts().list_for_booking(TENANT, id).await.unwrap();
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_capture_more_than_held_is_validation() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        h.service.authorize_deposit(TENANT, id, 50000, METHOD).await.unwrap();

        let err = h
            .service
            .capture_deposit(TENANT, id, 60000, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(h.mock.calls("capture"), 0);
    }

    #[tokio::test]
    async fn test_charge_then_refund() {
        let h = harness().await;
        let id = h.booking.id.as_str();

        let charged = h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        assert_eq!(charged.booking.status, BookingStatus::Confirmed);
        assert_eq!(charged.booking.charged_minor, 20000);
        let payment = charged.payment_record.unwrap();

        let refunded = h
            .service
            .refund_payment(TENANT, id, &payment.id, 2500, Some("late pickup"))
            .await
            .unwrap();
        assert_eq!(refunded.booking.refunded_minor, 2500);
        let refund = refunded.payment_record.unwrap();
        assert_eq!(refund.amount_minor, -2500);
        assert_eq!(refund.status, PaymentStatus::Refunded);
        assert_eq!(refund.processor_payment_id, payment.processor_ref);

        let err = h
            .service
            .refund_payment(TENANT, id, &payment.id, 20000, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transition(TransitionError::RefundExceedsCharged {
                refundable: 17500,
                ..
            })
        ));
        assert_eq!(h.mock.calls("refund"), 1);
    }

    #[tokio::test]
    async fn test_refund_rejects_payment_of_other_booking() {
        let h = harness().await;
        let other = Booking::new(TENANT, "cust-2", 10000, "USD", Utc::now());
        h.db.bookings().insert(&other).await.unwrap();

        let charged = h.service.charge_booking(TENANT, &other.id, 10000, METHOD).await.unwrap();
        let payment_id = charged.payment_record.unwrap().id;

        let err = h
            .service
            .refund_payment(TENANT, &h.booking.id, &payment_id, 100, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_decline_records_failure_and_rotates_key() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        h.mock.fail_next("charge", ProcessorError::InsufficientFunds);

        let err = h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);

        let records = h.db.payments().list_for_booking(TENANT, id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PaymentStatus::Failed);
        assert_eq!(records[0].payment_type, PaymentType::FullPayment);

        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.charged_minor, 0);

        // The retry goes out under a fresh key and succeeds.
        let charged = h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        assert_eq!(charged.booking.charged_minor, 20000);
        let keys = h.mock.keys("charge");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1], format!("{}/r1", keys[0]));
    }

    #[tokio::test]
    async fn test_charges_disabled_blocks_call() {
        let h = harness().await;
        let mut account = h.db.tenants().load(TENANT).await.unwrap();
        account.requirements_past_due = vec!["external_account".into()];
        h.db.tenants().save(&account).await.unwrap();

        let err = h
            .service
            .authorize_deposit(TENANT, &h.booking.id, 50000, METHOD)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChargesDisabled(_)));
        assert_eq!(h.mock.calls("charge"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_captures_apply_once() {
        let h = harness().await;
        let id = h.booking.id.clone();
        h.service.authorize_deposit(TENANT, &id, 50000, METHOD).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let service = h.service.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                service.capture_deposit(TENANT, &id, 7500, Some("fuel")).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(a) if a.outcome == Outcome::Applied => applied += 1,
                Ok(_) | Err(EngineError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(applied, 1);

        let booking = h.db.bookings().load(TENANT, &id).await.unwrap();
        assert_eq!(booking.deposit.captured_minor, 7500);
        let deposits = h
            .db
            .payments()
            .sum(TENANT, &id, PaymentType::Deposit, PaymentStatus::Succeeded)
            .await
            .unwrap();
        assert_eq!(deposits, 7500);
        assert!(h.mock.calls("capture") <= 2);
    }

    #[tokio::test]
    async fn test_timeout_is_unknown_until_reconciled() {
        let h = harness_with(Some(RetryPolicy {
            call_timeout: StdDuration::from_millis(50),
            max_attempts: 1,
            initial_backoff: StdDuration::from_millis(1),
            max_backoff: StdDuration::from_millis(1),
        }))
        .await;
        let id = h.booking.id.as_str();
        h.mock.delay_next("charge", StdDuration::from_secs(5));

        let err = h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap_err();
        let EngineError::OutcomeUnknown { idempotency_key } = err else {
            panic!("expected OutcomeUnknown, got {err}");
        };
        let attempt = h.db.attempts().get(&idempotency_key).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Unknown);
        assert_eq!(h.db.bookings().load(TENANT, id).await.unwrap().charged_minor, 0);

        let report = h.service.reconcile_unknown_attempts().await.unwrap();
        assert_eq!(report.resolved, 1);

        let booking = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(booking.charged_minor, 20000);
        let attempt = h.db.attempts().get(&idempotency_key).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Succeeded);
        assert!(h.mock.keys("charge").iter().all(|k| *k == idempotency_key));
    }

    #[tokio::test]
    async fn test_unavailable_resumes_same_key() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        h.mock
            .fail_next("charge", ProcessorError::Unavailable("502".into()));

        let err = h.service.charge_booking(TENANT, id, 5000, METHOD).await.unwrap_err();
        assert!(err.is_retryable());

        // The repeat re-issues the journaled call, card included.
        let charged = h
            .service
            .charge_booking(TENANT, id, 5000, "pm_card_other")
            .await
            .unwrap();
        assert_eq!(charged.booking.charged_minor, 5000);
        let keys = h.mock.keys("charge");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert!(h
            .mock
            .charge_requests()
            .iter()
            .all(|r| r.payment_method == METHOD));
    }

    #[tokio::test]
    async fn test_transfer_splits_fee_once() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        let charged = h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        let payment_id = charged.payment_record.unwrap().id;
        h.service
            .refund_payment(TENANT, id, &payment_id, 2000, None)
            .await
            .unwrap();

        let paid = h.service.transfer_to_tenant(TENANT, id).await.unwrap();
        let transfer = paid.transfer.unwrap();
        assert_eq!(transfer.amount_minor, 18000);
        assert_eq!(transfer.platform_fee_minor, 1800);
        assert_eq!(transfer.net_minor, 16200);
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.destination_account, "acct_1");

        let key = idempotency::transfer_key(&h.booking);
        let attempt = h.db.attempts().get(&key).await.unwrap().unwrap();
        assert_eq!(attempt.amount_minor, 16200);

        let again = h.service.transfer_to_tenant(TENANT, id).await.unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
        assert_eq!(h.mock.calls("transfer"), 1);
    }

    #[tokio::test]
    async fn test_transfer_waits_for_full_charge() {
        let h = harness().await;
        let id = h.booking.id.as_str();
        h.service.charge_booking(TENANT, id, 12000, METHOD).await.unwrap();

        let err = h.service.transfer_to_tenant(TENANT, id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transition(TransitionError::RentalOutstanding { outstanding: 8000 })
        ));
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(h.mock.calls("transfer"), 0);

        h.service.charge_booking(TENANT, id, 8000, METHOD).await.unwrap();
        let paid = h.service.transfer_to_tenant(TENANT, id).await.unwrap();
        assert_eq!(paid.transfer.unwrap().amount_minor, 20000);

        // Nothing more can be collected once the payout went out.
        let err = h.service.charge_booking(TENANT, id, 1000, METHOD).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(h.mock.calls("charge"), 2);
    }

    #[tokio::test]
    async fn test_payouts_disabled() {
        let h = harness().await;
        let mut account = h.db.tenants().load(TENANT).await.unwrap();
        account.payouts_enabled = false;
        h.db.tenants().save(&account).await.unwrap();

        let err = h
            .service
            .transfer_to_tenant(TENANT, &h.booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PayoutsDisabled(_)));
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_touch_booking() {
        let h = harness().await;
        let err = h
            .service
            .charge_booking("tenant-2", &h.booking.id, 1000, METHOD)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    fn timeout_policy() -> RetryPolicy {
        RetryPolicy {
            call_timeout: StdDuration::from_millis(50),
            max_attempts: 1,
            initial_backoff: StdDuration::from_millis(1),
            max_backoff: StdDuration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_unknown_charge_blocks_new_charge_until_reconciled() {
        let h = harness_with(Some(timeout_policy())).await;
        let id = h.booking.id.as_str();
        h.mock.delay_next("charge", StdDuration::from_secs(5));

        let err = h.service.charge_booking(TENANT, id, 12000, METHOD).await.unwrap_err();
        let EngineError::OutcomeUnknown { idempotency_key: pending } = err else {
            panic!("expected OutcomeUnknown, got {err}");
        };

        // A different amount means a different key; it must not go out
        // while the first charge may still have landed.
        let err = h.service.charge_booking(TENANT, id, 10000, METHOD).await.unwrap_err();
        let EngineError::Conflict(message) = err else {
            panic!("expected Conflict, got {err}");
        };
        assert!(message.contains(&pending));
        assert_eq!(h.mock.calls("charge"), 1);
        let attempts = h.db.attempts().list_for_booking(TENANT, id).await.unwrap();
        assert_eq!(attempts.len(), 1);

        // Deposit calls on the same booking wait too.
        let err = h
            .service
            .authorize_deposit(TENANT, id, 50000, METHOD)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(h.mock.calls("charge"), 1);

        let report = h.service.reconcile_unknown_attempts().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(h.db.bookings().load(TENANT, id).await.unwrap().charged_minor, 12000);

        // Once settled, the remaining balance can be charged.
        let charged = h.service.charge_booking(TENANT, id, 8000, METHOD).await.unwrap();
        assert_eq!(charged.booking.charged_minor, 20000);

        // The processor collapses repeats of one key into one charge.
        let mut by_key = std::collections::HashMap::new();
        for r in h.mock.charge_requests() {
            by_key.insert(r.idempotency_key, r.amount_minor);
        }
        assert_eq!(by_key.len(), 2);
        assert_eq!(by_key.values().sum::<i64>(), charged.booking.total_minor);
    }

    #[tokio::test]
    async fn test_reissued_charge_uses_journaled_payment_method() {
        let h = harness_with(Some(timeout_policy())).await;
        let id = h.booking.id.as_str();
        h.mock.delay_next("charge", StdDuration::from_secs(5));

        let err = h
            .service
            .charge_booking(TENANT, id, 20000, "pm_card_amex")
            .await
            .unwrap_err();
        let EngineError::OutcomeUnknown { idempotency_key } = err else {
            panic!("expected OutcomeUnknown, got {err}");
        };
        let attempt = h.db.attempts().get(&idempotency_key).await.unwrap().unwrap();
        assert_eq!(attempt.payment_method_ref.as_deref(), Some("pm_card_amex"));

        h.service.reconcile_unknown_attempts().await.unwrap();

        let requests = h.mock.charge_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.payment_method == "pm_card_amex" && r.idempotency_key == idempotency_key));
    }

    #[tokio::test]
    async fn test_charge_requires_payment_method() {
        let h = harness().await;
        let err = h
            .service
            .charge_booking(TENANT, &h.booking.id, 20000, " ")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(h.mock.calls("charge"), 0);
    }

    #[tokio::test]
    async fn test_advance_booking_through_rental() {
        let h = harness().await;
        let id = h.booking.id.as_str();

        // Picking up before the rental is paid for is refused.
        let err = h
            .service
            .advance_booking(TENANT, id, BookingStatus::PickedUp)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);

        h.service.charge_booking(TENANT, id, 20000, METHOD).await.unwrap();
        for to in [
            BookingStatus::PickedUp,
            BookingStatus::Active,
            BookingStatus::Returned,
        ] {
            let applied = h.service.advance_booking(TENANT, id, to).await.unwrap();
            assert_eq!(applied.outcome, Outcome::Applied);
            assert!(applied.payment_record.is_none());
            assert_eq!(h.db.bookings().load(TENANT, id).await.unwrap().status, to);
        }

        // Repeating a step is a no-op; skipping one is a conflict.
        let again = h
            .service
            .advance_booking(TENANT, id, BookingStatus::Returned)
            .await
            .unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
        let err = h
            .service
            .advance_booking(TENANT, id, BookingStatus::Cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);

        let done = h
            .service
            .advance_booking(TENANT, id, BookingStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.booking.status, BookingStatus::Completed);
        let stored = h.db.bookings().load(TENANT, id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Completed);
        assert_eq!(stored.charged_minor, 20000);

        let records = h.db.payments().list_for_booking(TENANT, id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(h.mock.calls("charge"), 1);
    }

    #[tokio::test]
    async fn test_advance_booking_rejects_bad_ids() {
        let h = harness().await;
        let err = h
            .service
            .advance_booking(TENANT, "", BookingStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = h
            .service
            .advance_booking("tenant-2", &h.booking.id, BookingStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn test_expect_status() {
        let pi = |status: &str| PaymentIntent {
            id: "pi_1".into(),
            status: status.into(),
            amount_minor: 100,
        };
        assert!(expect_status(&pi("succeeded"), "succeeded").is_ok());
        assert!(expect_status(&pi("requires_payment_method"), "succeeded")
            .unwrap_err()
            .is_decline());
        assert!(expect_status(&pi("processing"), "succeeded")
            .unwrap_err()
            .is_ambiguous());
    }
}
