//! # Settlement Ledger
//!
//! The one place booking money state changes.
//!
//! ## apply_transition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ONE SQLITE TRANSACTION                            │
//! │                                                                         │
//! │  1. UPDATE bookings SET version = version + 1     ← write lock first   │
//! │  2. SELECT booking                                                      │
//! │  3. processor_ref already in payment_records?  ──yes──► AlreadyApplied  │
//! │  4. state_machine::apply(booking, intent, ctx)  ──err──► ROLLBACK       │
//! │  5. UPDATE bookings (state + running totals)                            │
//! │  6. INSERT payment_records / transfers                                  │
//! │  7. UPDATE settlement_attempts → succeeded                              │
//! │  8. UPDATE webhook_events → processed                                   │
//! │  9. COMMIT                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two transitions on the same booking queue on step 1. Transitions on
//! different bookings touch different rows; SQLite still has a single
//! writer, so they serialise briefly but never conflict.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, LedgerError, LedgerResult};
use crate::pool::Database;
use crate::repository::{attempt, booking, payment, tenant, transfer, webhook};
use crate::unit_of_work::UnitOfWork;
use fleetpay_core::state_machine::{self, transfer_status_transition};
use fleetpay_core::{
    Booking, Intent, Movement, Outcome, PaymentRecord, PaymentStatus, PaymentType, TenantAccount,
    Transfer, TransferStatus, TransitionContext,
};

// =============================================================================
// Command
// =============================================================================

/// Everything needed to apply one intent to one booking.
#[derive(Debug, Clone)]
pub struct TransitionCommand {
    pub tenant_id: String,
    pub booking_id: String,
    pub intent: Intent,
    /// Processor id of the movement; the dedup key for the ledger entry.
    pub processor_ref: Option<String>,
    /// For refunds: the charge being refunded.
    pub processor_payment_id: Option<String>,
    /// Attempt to mark succeeded in the same transaction.
    pub idempotency_key: Option<String>,
    /// Webhook event to mark processed in the same transaction.
    pub webhook_event_id: Option<String>,
    pub reason: Option<String>,
    /// For transfers: the tenant's sub-account and the status the processor
    /// reported at creation.
    pub destination_account: Option<String>,
    pub transfer_status: TransferStatus,
}

impl TransitionCommand {
    pub fn new(tenant_id: impl Into<String>, booking_id: impl Into<String>, intent: Intent) -> Self {
        TransitionCommand {
            tenant_id: tenant_id.into(),
            booking_id: booking_id.into(),
            intent,
            processor_ref: None,
            processor_payment_id: None,
            idempotency_key: None,
            webhook_event_id: None,
            reason: None,
            destination_account: None,
            transfer_status: TransferStatus::Pending,
        }
    }

    pub fn processor_ref(mut self, processor_ref: Option<String>) -> Self {
        self.processor_ref = processor_ref;
        self
    }

    pub fn refund_of(mut self, processor_payment_id: Option<String>) -> Self {
        self.processor_payment_id = processor_payment_id;
        self
    }

    pub fn attempt(mut self, idempotency_key: Option<String>) -> Self {
        self.idempotency_key = idempotency_key;
        self
    }

    pub fn webhook(mut self, event_id: Option<String>) -> Self {
        self.webhook_event_id = event_id;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn destination(mut self, account: impl Into<String>, status: TransferStatus) -> Self {
        self.destination_account = Some(account.into());
        self.transfer_status = status;
        self
    }

    fn records_failure(&self) -> bool {
        matches!(self.intent, Intent::RecordFailure { .. })
    }
}

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Booking state after the transaction.
    pub booking: Booking,
    pub outcome: Outcome,
    /// The entry written, or the existing one that made this a duplicate.
    pub payment_record: Option<PaymentRecord>,
    pub transfer: Option<Transfer>,
}

// =============================================================================
// Operations
// =============================================================================

/// Loads a booking scoped to its tenant.
pub async fn load_booking(db: &Database, tenant_id: &str, booking_id: &str) -> LedgerResult<Booking> {
    Ok(db.bookings().load(tenant_id, booking_id).await?)
}

/// Applies `cmd` in a single transaction. See the module docs.
///
/// A [`LedgerError::Transition`] means nothing was written, including the
/// attempt and webhook marks.
pub async fn apply_transition(
    db: &Database,
    cmd: &TransitionCommand,
    ctx: &TransitionContext,
) -> LedgerResult<Applied> {
    let mut uow = db.begin().await?;
    uow.lock_booking(&cmd.tenant_id, &cmd.booking_id).await?;

    let current = booking::fetch(uow.conn(), &cmd.tenant_id, &cmd.booking_id)
        .await?
        .ok_or_else(|| DbError::not_found("Booking", &cmd.booking_id))?;

    if !cmd.records_failure() {
        if let Some(processor_ref) = cmd.processor_ref.as_deref() {
            if let Some(existing) = payment::find_by_processor_ref(uow.conn(), processor_ref).await? {
                debug!(
                    booking_id = %cmd.booking_id,
                    processor_ref,
                    "Processor reference already recorded"
                );
                finish(&mut uow, cmd, Outcome::AlreadyApplied, ctx.now).await?;
                uow.commit().await?;
                return Ok(Applied {
                    booking: current,
                    outcome: Outcome::AlreadyApplied,
                    payment_record: Some(existing),
                    transfer: None,
                });
            }
            if let Some(existing) = transfer::find_by_processor_id(uow.conn(), processor_ref).await? {
                debug!(
                    booking_id = %cmd.booking_id,
                    processor_ref,
                    "Transfer reference already recorded"
                );
                finish(&mut uow, cmd, Outcome::AlreadyApplied, ctx.now).await?;
                uow.commit().await?;
                return Ok(Applied {
                    booking: current,
                    outcome: Outcome::AlreadyApplied,
                    payment_record: None,
                    transfer: Some(existing),
                });
            }
        }
    }

    let transition = state_machine::apply(&current, &cmd.intent, ctx)?;

    let mut applied = Applied {
        booking: transition.booking.clone(),
        outcome: transition.outcome,
        payment_record: None,
        transfer: None,
    };

    if transition.is_applied() {
        booking::update_state(uow.conn(), &transition.booking).await?;

        match transition.movement {
            Some(Movement::Payment {
                payment_type,
                amount_minor,
                status,
            }) => {
                let record = payment_record(cmd, &current, payment_type, amount_minor, status, ctx.now);
                append_payment_record(&mut uow, &record).await?;
                applied.payment_record = Some(record);
            }
            Some(Movement::Transfer {
                amount_minor,
                platform_fee_minor,
                net_minor,
            }) => {
                let destination = cmd
                    .destination_account
                    .clone()
                    .ok_or(LedgerError::Incomplete("destination_account"))?;

                let row = Transfer {
                    id: Uuid::new_v4().to_string(),
                    booking_id: current.id.clone(),
                    tenant_id: current.tenant_id.clone(),
                    amount_minor,
                    platform_fee_minor,
                    net_minor,
                    currency: current.currency.clone(),
                    destination_account: destination,
                    processor_transfer_id: cmd.processor_ref.clone(),
                    status: cmd.transfer_status,
                    failure_code: None,
                    failure_message: None,
                    created_at: ctx.now,
                    updated_at: ctx.now,
                };
                // Payouts leave the booking's collected funds; they live in
                // `transfers` only and never enter the payment record sum.
                transfer::insert(uow.conn(), &row).await?;
                applied.transfer = Some(row);
            }
            None => {}
        }
    }

    finish(&mut uow, cmd, transition.outcome, ctx.now).await?;
    uow.commit().await?;

    match applied.outcome {
        Outcome::Applied => info!(
            booking_id = %cmd.booking_id,
            intent = cmd.intent.label(),
            booking_status = applied.booking.status.as_str(),
            deposit_status = applied.booking.deposit.status.as_str(),
            "Transition applied"
        ),
        Outcome::AlreadyApplied => debug!(
            booking_id = %cmd.booking_id,
            intent = cmd.intent.label(),
            "Transition already applied"
        ),
    }

    Ok(applied)
}

/// Appends a ledger entry inside a caller-held unit of work.
///
/// Fails with `UniqueViolation` if the processor reference is already
/// recorded. Running totals are the caller's responsibility.
pub async fn append_payment_record(uow: &mut UnitOfWork, record: &PaymentRecord) -> LedgerResult<()> {
    payment::insert(uow.conn(), record).await?;
    Ok(())
}

/// Marks the attempt and webhook event that produced this command.
async fn finish(
    uow: &mut UnitOfWork,
    cmd: &TransitionCommand,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    if let Some(key) = cmd.idempotency_key.as_deref() {
        attempt::mark_succeeded(uow.conn(), key, cmd.processor_ref.as_deref(), now).await?;
    }
    if let Some(event_id) = cmd.webhook_event_id.as_deref() {
        let note = match outcome {
            Outcome::Applied => None,
            Outcome::AlreadyApplied => Some("already applied"),
        };
        webhook::mark_processed(uow.conn(), event_id, note, now).await?;
    }
    Ok(())
}

fn payment_record(
    cmd: &TransitionCommand,
    booking: &Booking,
    payment_type: PaymentType,
    amount_minor: i64,
    status: PaymentStatus,
    now: DateTime<Utc>,
) -> PaymentRecord {
    // A failed payment intent can still succeed later under the same id, so
    // failed entries keep the reference out of the unique column.
    let (processor_ref, processor_payment_id) = if status == PaymentStatus::Failed {
        (None, cmd.processor_ref.clone().or_else(|| cmd.processor_payment_id.clone()))
    } else {
        (cmd.processor_ref.clone(), cmd.processor_payment_id.clone())
    };

    PaymentRecord {
        id: Uuid::new_v4().to_string(),
        booking_id: Some(booking.id.clone()),
        tenant_id: booking.tenant_id.clone(),
        payment_type,
        amount_minor,
        currency: booking.currency.clone(),
        status,
        processor_ref,
        processor_payment_id,
        idempotency_key: cmd.idempotency_key.clone(),
        reason: cmd.reason.clone(),
        processed_at: now,
    }
}

// =============================================================================
// Transfer Status
// =============================================================================

/// Result of [`apply_transfer_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUpdate {
    pub transfer: Transfer,
    pub outcome: Outcome,
}

/// Applies a processor-reported payout status change.
///
/// Runs under the owning booking's lock so it serialises with any other
/// transition on that booking.
pub async fn apply_transfer_status(
    db: &Database,
    processor_transfer_id: &str,
    to: TransferStatus,
    failure: Option<(&str, &str)>,
    webhook_event_id: Option<&str>,
    now: DateTime<Utc>,
) -> LedgerResult<TransferUpdate> {
    let owner = transfer::find_by_processor_id(db.pool(), processor_transfer_id)
        .await?
        .ok_or_else(|| DbError::not_found("Transfer", processor_transfer_id))?;

    let mut uow = db.begin().await?;
    uow.lock_booking(&owner.tenant_id, &owner.booking_id).await?;

    let mut current = transfer::find_by_processor_id(uow.conn(), processor_transfer_id)
        .await?
        .ok_or_else(|| DbError::not_found("Transfer", processor_transfer_id))?;

    let outcome = transfer_status_transition(current.status, to)?;

    if outcome == Outcome::Applied {
        let (code, message) = failure.unzip();
        transfer::update_status(uow.conn(), &current.id, current.status, to, code, message, now)
            .await?;

        if to == TransferStatus::Reversed {
            warn!(
                booking_id = %current.booking_id,
                processor_transfer_id,
                "Transfer reversed by processor"
            );
        }

        current.status = to;
        if let Some((code, message)) = failure {
            current.failure_code = Some(code.to_string());
            current.failure_message = Some(message.to_string());
        }
        current.updated_at = now;
    }

    if let Some(event_id) = webhook_event_id {
        let note = (outcome == Outcome::AlreadyApplied).then_some("already applied");
        webhook::mark_processed(uow.conn(), event_id, note, now).await?;
    }

    uow.commit().await?;

    info!(
        processor_transfer_id,
        status = to.as_str(),
        ?outcome,
        "Transfer status recorded"
    );

    Ok(TransferUpdate {
        transfer: current,
        outcome,
    })
}

// =============================================================================
// Tenant Accounts
// =============================================================================

/// Saves a processor-confirmed account snapshot and marks the webhook that
/// carried it, in one transaction.
pub async fn save_account(
    db: &Database,
    account: &TenantAccount,
    webhook_event_id: Option<&str>,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    let mut uow = db.begin().await?;
    tenant::upsert(uow.conn(), account).await?;
    if let Some(event_id) = webhook_event_id {
        webhook::mark_processed(uow.conn(), event_id, None, now).await?;
    }
    uow.commit().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
