//! # Settlement State Machine
//!
//! Pure transition function for bookings and their security deposits.
//!
//! ## Deposit Lifecycle
//! ```text
//!                 authorize                capture (≤ authorized)
//!   ┌─────────┐ ───────────► ┌────────────┐ ─────────────────────► ┌──────────┐
//!   │ Pending │              │ Authorized │                        │ Captured │
//!   └─────────┘              └─────┬──────┘                        └──────────┘
//!                                  │  ▲   release
//!                  re-authorize    │  │ ─────────────────────────► ┌──────────┐
//!                  (stale only)    └──┘                            │ Released │
//!                                                                  └──────────┘
//! ```
//!
//! ## Booking Lifecycle
//! ```text
//!   Pending ─► Confirmed ─► PickedUp ─► Active ─► Returned ─► Completed
//!      │           │
//!      └───────────┴──► Cancelled | NoShow
//! ```
//!
//! [`apply`] never performs I/O. It returns the next booking state, whether
//! anything changed, and the money movement the ledger has to record. The
//! ledger calls it inside the transaction after taking the booking lock; the
//! settlement service also calls it as a dry run before talking to the
//! processor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::fee::{self, FeeRate};
use crate::types::{
    Booking, BookingStatus, DepositStatus, PaymentStatus, PaymentType, TransferStatus,
};
use crate::DEFAULT_HOLD_WINDOW_DAYS;

// =============================================================================
// Inputs
// =============================================================================

/// Clock and policy inputs for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// How long a card authorization stays capturable.
    pub hold_window: Duration,
}

impl TransitionContext {
    pub fn new(now: DateTime<Utc>, hold_window: Duration) -> Self {
        TransitionContext { now, hold_window }
    }

    /// Context with the default 7-day hold window.
    pub fn at(now: DateTime<Utc>) -> Self {
        TransitionContext {
            now,
            hold_window: Duration::days(DEFAULT_HOLD_WINDOW_DAYS),
        }
    }
}

/// Something the caller or the processor wants to happen to a booking.
///
/// Processor references are optional so the same intent can be dry-run
/// before the processor call returns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Place (or renew) a hold on the customer's card.
    AuthorizeDeposit {
        amount_minor: i64,
        authorization_ref: Option<String>,
    },
    /// Convert part or all of the hold into a charge.
    CaptureDeposit {
        amount_minor: i64,
        reason: Option<String>,
    },
    /// Cancel the hold.
    ReleaseDeposit { reason: Option<String> },
    /// Collect (part of) the rental price.
    Charge {
        amount_minor: i64,
        charge_ref: Option<String>,
    },
    /// Return previously collected funds.
    Refund { amount_minor: i64 },
    /// Pay collected funds out to the tenant, minus the platform fee.
    Transfer {
        fee_rate: FeeRate,
        transfer_ref: Option<String>,
    },
    /// A declined or failed processor call. Leaves the booking untouched
    /// but is written to the ledger as a `failed` entry.
    RecordFailure {
        payment_type: PaymentType,
        amount_minor: i64,
    },
    /// Move the rental itself along its lifecycle.
    Advance { to: BookingStatus },
}

impl Intent {
    /// Short label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Intent::AuthorizeDeposit { .. } => "authorize",
            Intent::CaptureDeposit { .. } => "capture",
            Intent::ReleaseDeposit { .. } => "release",
            Intent::Charge { .. } => "charge",
            Intent::Refund { .. } => "refund",
            Intent::Transfer { .. } => "transfer",
            Intent::RecordFailure { .. } => "record failure",
            Intent::Advance { to } => advance_label(*to),
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// State changed; the movement (if any) must be recorded.
    Applied,
    /// The intent had already taken effect. Nothing to write.
    AlreadyApplied,
}

/// Money the ledger must record for an applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Movement {
    /// A `payment_records` entry. Refunds carry a negative amount.
    Payment {
        payment_type: PaymentType,
        amount_minor: i64,
        status: PaymentStatus,
    },
    /// A payout to the tenant.
    Transfer {
        amount_minor: i64,
        platform_fee_minor: i64,
        net_minor: i64,
    },
}

/// Result of [`apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub booking: Booking,
    pub outcome: Outcome,
    pub movement: Option<Movement>,
}

impl Transition {
    fn applied(booking: Booking, movement: Option<Movement>) -> Self {
        Transition {
            booking,
            outcome: Outcome::Applied,
            movement,
        }
    }

    fn already_applied(booking: &Booking) -> Self {
        Transition {
            booking: booking.clone(),
            outcome: Outcome::AlreadyApplied,
            movement: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.outcome == Outcome::Applied
    }
}

// =============================================================================
// Transition Function
// =============================================================================

/// Computes the next state of `booking` under `intent`.
///
/// `updated_at` is set to `ctx.now` on every applied transition; `version`
/// is left alone because the ledger owns it.
pub fn apply(
    booking: &Booking,
    intent: &Intent,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    let mut next = booking.clone();
    next.updated_at = ctx.now;

    match intent {
        Intent::AuthorizeDeposit {
            amount_minor,
            authorization_ref,
        } => authorize(booking, next, *amount_minor, authorization_ref.as_deref(), ctx),

        Intent::CaptureDeposit {
            amount_minor,
            reason,
        } => capture(booking, next, *amount_minor, reason.clone(), ctx),

        Intent::ReleaseDeposit { reason } => release(booking, next, reason.clone(), ctx),

        Intent::Charge {
            amount_minor,
            charge_ref,
        } => charge(booking, next, *amount_minor, charge_ref.as_deref()),

        Intent::Refund { amount_minor } => refund(booking, next, *amount_minor),

        Intent::Transfer {
            fee_rate,
            transfer_ref,
        } => transfer(booking, next, *fee_rate, transfer_ref.as_deref()),

        Intent::RecordFailure {
            payment_type,
            amount_minor,
        } => Ok(Transition::applied(
            booking.clone(),
            Some(Movement::Payment {
                payment_type: *payment_type,
                amount_minor: *amount_minor,
                status: PaymentStatus::Failed,
            }),
        )),

        Intent::Advance { to } => advance(booking, next, *to),
    }
}

fn authorize(
    booking: &Booking,
    mut next: Booking,
    amount_minor: i64,
    authorization_ref: Option<&str>,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    ensure_positive(amount_minor)?;
    ensure_booking_open(booking, "authorize")?;

    let deposit = &booking.deposit;
    match deposit.status {
        DepositStatus::Pending => {}
        DepositStatus::Authorized => {
            let same_ref = authorization_ref.is_some()
                && authorization_ref == deposit.authorization_ref.as_deref();
            if same_ref {
                return Ok(Transition::already_applied(booking));
            }
            if !deposit.is_stale(ctx.now, ctx.hold_window) {
                return Err(TransitionError::AlreadyAuthorized {
                    existing: deposit
                        .authorization_ref
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
            // Stale hold: fall through and renew it under a new generation.
        }
        DepositStatus::Captured | DepositStatus::Released => {
            return Err(TransitionError::DepositConflict {
                intent: "authorize",
                status: deposit.status,
            });
        }
    }

    next.deposit.status = DepositStatus::Authorized;
    next.deposit.authorized_minor = amount_minor;
    next.deposit.authorization_ref = authorization_ref.map(str::to_string);
    next.deposit.authorized_at = Some(ctx.now);
    next.deposit.generation = deposit.generation + 1;

    Ok(Transition::applied(next, None))
}

fn capture(
    booking: &Booking,
    mut next: Booking,
    amount_minor: i64,
    reason: Option<String>,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    let deposit = &booking.deposit;
    match deposit.status {
        DepositStatus::Captured => return Ok(Transition::already_applied(booking)),
        DepositStatus::Pending | DepositStatus::Released => {
            return Err(TransitionError::DepositConflict {
                intent: "capture",
                status: deposit.status,
            });
        }
        DepositStatus::Authorized => {}
    }

    ensure_positive(amount_minor)?;
    if amount_minor > deposit.authorized_minor {
        return Err(TransitionError::ExceedsAuthorized {
            requested: amount_minor,
            authorized: deposit.authorized_minor,
        });
    }
    if deposit.is_stale(ctx.now, ctx.hold_window) {
        return Err(TransitionError::StaleAuthorization);
    }

    next.deposit.status = DepositStatus::Captured;
    next.deposit.captured_minor = amount_minor;
    next.deposit.released_remainder_minor = deposit.authorized_minor - amount_minor;
    next.deposit.settled_at = Some(ctx.now);
    next.deposit.reason = reason;

    Ok(Transition::applied(
        next,
        Some(Movement::Payment {
            payment_type: PaymentType::Deposit,
            amount_minor,
            status: PaymentStatus::Succeeded,
        }),
    ))
}

fn release(
    booking: &Booking,
    mut next: Booking,
    reason: Option<String>,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    let deposit = &booking.deposit;
    match deposit.status {
        DepositStatus::Released => return Ok(Transition::already_applied(booking)),
        DepositStatus::Pending | DepositStatus::Captured => {
            return Err(TransitionError::DepositConflict {
                intent: "release",
                status: deposit.status,
            });
        }
        DepositStatus::Authorized => {}
    }

    if deposit.is_stale(ctx.now, ctx.hold_window) {
        return Err(TransitionError::StaleAuthorization);
    }

    next.deposit.status = DepositStatus::Released;
    next.deposit.released_remainder_minor = deposit.authorized_minor;
    next.deposit.settled_at = Some(ctx.now);
    next.deposit.reason = reason;

    Ok(Transition::applied(next, None))
}

fn charge(
    booking: &Booking,
    mut next: Booking,
    amount_minor: i64,
    charge_ref: Option<&str>,
) -> Result<Transition, TransitionError> {
    if charge_ref.is_some() && charge_ref == booking.processor_charge_ref.as_deref() {
        return Ok(Transition::already_applied(booking));
    }

    ensure_positive(amount_minor)?;
    ensure_booking_open(booking, "charge")?;

    let outstanding = booking.outstanding_minor();
    if amount_minor > outstanding {
        return Err(TransitionError::OverCollect {
            requested: amount_minor,
            outstanding,
        });
    }

    next.charged_minor += amount_minor;
    if charge_ref.is_some() {
        next.processor_charge_ref = charge_ref.map(str::to_string);
    }
    if booking.status == BookingStatus::Pending {
        next.status = BookingStatus::Confirmed;
    }

    Ok(Transition::applied(
        next,
        Some(Movement::Payment {
            payment_type: PaymentType::FullPayment,
            amount_minor,
            status: PaymentStatus::Succeeded,
        }),
    ))
}

fn refund(
    booking: &Booking,
    mut next: Booking,
    amount_minor: i64,
) -> Result<Transition, TransitionError> {
    ensure_positive(amount_minor)?;

    let refundable = booking.refundable_minor();
    if amount_minor > refundable {
        return Err(TransitionError::RefundExceedsCharged {
            requested: amount_minor,
            refundable,
        });
    }

    next.refunded_minor += amount_minor;

    Ok(Transition::applied(
        next,
        Some(Movement::Payment {
            payment_type: PaymentType::Refund,
            amount_minor: -amount_minor,
            status: PaymentStatus::Refunded,
        }),
    ))
}

fn transfer(
    booking: &Booking,
    mut next: Booking,
    fee_rate: FeeRate,
    transfer_ref: Option<&str>,
) -> Result<Transition, TransitionError> {
    if booking.transferred_minor > 0 || booking.processor_transfer_ref.is_some() {
        return Ok(Transition::already_applied(booking));
    }

    // One payout per booking, so it waits until nothing more can be charged.
    let outstanding = booking.outstanding_minor();
    if outstanding > 0 && !booking.status.is_terminal() {
        return Err(TransitionError::RentalOutstanding { outstanding });
    }

    let collected = booking.refundable_minor();
    if collected <= 0 {
        return Err(TransitionError::NothingToTransfer {
            collected,
            transferred: booking.transferred_minor,
        });
    }

    let split = fee::split(collected, fee_rate);

    next.transferred_minor = collected;
    next.platform_fee_minor = Some(split.platform_fee_minor);
    next.net_minor = Some(split.net_minor);
    next.processor_transfer_ref = transfer_ref.map(str::to_string);

    Ok(Transition::applied(
        next,
        Some(Movement::Transfer {
            amount_minor: collected,
            platform_fee_minor: split.platform_fee_minor,
            net_minor: split.net_minor,
        }),
    ))
}

fn advance(
    booking: &Booking,
    mut next: Booking,
    to: BookingStatus,
) -> Result<Transition, TransitionError> {
    if booking.status == to {
        return Ok(Transition::already_applied(booking));
    }
    if !can_advance(booking.status, to) {
        return Err(TransitionError::BookingConflict {
            intent: advance_label(to),
            status: booking.status,
        });
    }

    next.status = to;
    Ok(Transition::applied(next, None))
}

/// Returns true if a booking may move from `from` to `to` in one step.
pub fn can_advance(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;

    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Confirmed, PickedUp)
            | (PickedUp, Active)
            | (Active, Returned)
            | (Returned, Completed)
            | (Pending | Confirmed, Cancelled | NoShow)
    )
}

fn advance_label(to: BookingStatus) -> &'static str {
    match to {
        BookingStatus::Pending => "reopen",
        BookingStatus::Confirmed => "confirm",
        BookingStatus::PickedUp => "pick up",
        BookingStatus::Active => "activate",
        BookingStatus::Returned => "return",
        BookingStatus::Completed => "complete",
        BookingStatus::Cancelled => "cancel",
        BookingStatus::NoShow => "mark no-show",
    }
}

fn ensure_positive(amount_minor: i64) -> Result<(), TransitionError> {
    if amount_minor <= 0 {
        return Err(TransitionError::NonPositiveAmount(amount_minor));
    }
    Ok(())
}

fn ensure_booking_open(booking: &Booking, intent: &'static str) -> Result<(), TransitionError> {
    if booking.status.is_terminal() {
        return Err(TransitionError::BookingConflict {
            intent,
            status: booking.status,
        });
    }
    Ok(())
}

// =============================================================================
// Transfer Status
// =============================================================================

/// Validates a payout status change reported by the processor.
pub fn transfer_status_transition(
    from: TransferStatus,
    to: TransferStatus,
) -> Result<Outcome, TransitionError> {
    use TransferStatus::*;

    if from == to {
        return Ok(Outcome::AlreadyApplied);
    }
    match (from, to) {
        (Pending, Paid | Failed | Reversed) | (Paid, Reversed) => Ok(Outcome::Applied),
        _ => Err(TransitionError::TransferConflict {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(total: i64) -> Booking {
        Booking::new("tenant-1", "cust-1", total, "USD", Utc::now())
    }

    fn ctx() -> TransitionContext {
        TransitionContext::at(Utc::now())
    }

    fn step(b: &Booking, intent: Intent) -> Booking {
        let t = apply(b, &intent, &ctx()).unwrap();
        assert!(t.is_applied(), "{intent:?} was not applied");
        t.booking
    }

    fn authorized(amount: i64) -> Booking {
        step(
            &booking(20000),
            Intent::AuthorizeDeposit {
                amount_minor: amount,
                authorization_ref: Some("pi_dep_1".into()),
            },
        )
    }

    #[test]
    fn test_partial_capture_then_release_conflicts() {
        let b = authorized(50000);
        assert_eq!(b.deposit.status, DepositStatus::Authorized);
        assert_eq!(b.deposit.generation, 1);

        let t = apply(
            &b,
            &Intent::CaptureDeposit {
                amount_minor: 7500,
                reason: Some("fuel".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert!(t.is_applied());
        assert_eq!(t.booking.deposit.status, DepositStatus::Captured);
        assert_eq!(t.booking.deposit.captured_minor, 7500);
        assert_eq!(t.booking.deposit.released_remainder_minor, 42500);
        assert_eq!(t.booking.deposit.reason.as_deref(), Some("fuel"));
        assert_eq!(
            t.movement,
            Some(Movement::Payment {
                payment_type: PaymentType::Deposit,
                amount_minor: 7500,
                status: PaymentStatus::Succeeded,
            })
        );

        let err = apply(&t.booking, &Intent::ReleaseDeposit { reason: None }, &ctx()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::DepositConflict {
                intent: "release",
                status: DepositStatus::Captured,
            }
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_same_terminal_intent_is_already_applied() {
        let captured = step(
            &authorized(50000),
            Intent::CaptureDeposit {
                amount_minor: 50000,
                reason: None,
            },
        );
        let again = apply(
            &captured,
            &Intent::CaptureDeposit {
                amount_minor: 50000,
                reason: None,
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
        assert_eq!(again.booking, captured);
        assert!(again.movement.is_none());

        let released = step(&authorized(50000), Intent::ReleaseDeposit { reason: None });
        let again = apply(&released, &Intent::ReleaseDeposit { reason: None }, &ctx()).unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);

        let err = apply(
            &released,
            &Intent::CaptureDeposit {
                amount_minor: 1,
                reason: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_capture_cannot_exceed_authorized() {
        let b = authorized(50000);
        let err = apply(
            &b,
            &Intent::CaptureDeposit {
                amount_minor: 50001,
                reason: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransitionError::ExceedsAuthorized {
                requested: 50001,
                authorized: 50000,
            }
        );
        assert!(err.is_validation());
    }

    #[test]
    fn test_capture_before_authorize_conflicts() {
        let err = apply(
            &booking(100),
            &Intent::CaptureDeposit {
                amount_minor: 10,
                reason: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_stale_authorization_blocks_capture_and_release() {
        let b = authorized(50000);
        let later = TransitionContext::at(Utc::now() + Duration::days(8));

        let err = apply(
            &b,
            &Intent::CaptureDeposit {
                amount_minor: 100,
                reason: None,
            },
            &later,
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::StaleAuthorization);

        let err = apply(&b, &Intent::ReleaseDeposit { reason: None }, &later).unwrap_err();
        assert_eq!(err, TransitionError::StaleAuthorization);
    }

    #[test]
    fn test_reauthorize_only_when_stale() {
        let b = authorized(50000);

        let fresh = apply(
            &b,
            &Intent::AuthorizeDeposit {
                amount_minor: 50000,
                authorization_ref: Some("pi_dep_2".into()),
            },
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(fresh, TransitionError::AlreadyAuthorized { .. }));

        let later = TransitionContext::at(Utc::now() + Duration::days(8));
        let t = apply(
            &b,
            &Intent::AuthorizeDeposit {
                amount_minor: 40000,
                authorization_ref: Some("pi_dep_2".into()),
            },
            &later,
        )
        .unwrap();
        assert!(t.is_applied());
        assert_eq!(t.booking.deposit.generation, 2);
        assert_eq!(t.booking.deposit.authorized_minor, 40000);
        assert_eq!(t.booking.deposit.authorization_ref.as_deref(), Some("pi_dep_2"));
        assert!(!t.booking.deposit.is_stale(later.now, later.hold_window));
    }

    #[test]
    fn test_authorize_same_ref_is_already_applied() {
        let b = authorized(50000);
        let t = apply(
            &b,
            &Intent::AuthorizeDeposit {
                amount_minor: 50000,
                authorization_ref: Some("pi_dep_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.outcome, Outcome::AlreadyApplied);
    }

    #[test]
    fn test_charge_confirms_booking_and_never_over_collects() {
        let b = booking(10000);
        let t = apply(
            &b,
            &Intent::Charge {
                amount_minor: 6000,
                charge_ref: Some("ch_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.booking.status, BookingStatus::Confirmed);
        assert_eq!(t.booking.charged_minor, 6000);

        let err = apply(
            &t.booking,
            &Intent::Charge {
                amount_minor: 4001,
                charge_ref: Some("ch_2".into()),
            },
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransitionError::OverCollect {
                requested: 4001,
                outstanding: 4000,
            }
        );

        // Same charge reference again
        let again = apply(
            &t.booking,
            &Intent::Charge {
                amount_minor: 6000,
                charge_ref: Some("ch_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
    }

    #[test]
    fn test_charge_on_cancelled_booking_conflicts() {
        let cancelled = step(
            &booking(10000),
            Intent::Advance {
                to: BookingStatus::Cancelled,
            },
        );
        let err = apply(
            &cancelled,
            &Intent::Charge {
                amount_minor: 100,
                charge_ref: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransitionError::BookingConflict {
                intent: "charge",
                status: BookingStatus::Cancelled,
            }
        );
    }

    #[test]
    fn test_refunds_never_exceed_charged() {
        let b = step(
            &booking(10000),
            Intent::Charge {
                amount_minor: 10000,
                charge_ref: Some("ch_1".into()),
            },
        );
        let b = step(&b, Intent::Refund { amount_minor: 4000 });
        assert_eq!(b.refunded_minor, 4000);

        let err = apply(&b, &Intent::Refund { amount_minor: 6001 }, &ctx()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::RefundExceedsCharged {
                requested: 6001,
                refundable: 6000,
            }
        );

        let t = apply(&b, &Intent::Refund { amount_minor: 6000 }, &ctx()).unwrap();
        assert_eq!(t.booking.refunded_minor, 10000);
        assert_eq!(
            t.movement,
            Some(Movement::Payment {
                payment_type: PaymentType::Refund,
                amount_minor: -6000,
                status: PaymentStatus::Refunded,
            })
        );
    }

    #[test]
    fn test_refund_without_charge_is_rejected() {
        let err = apply(&booking(100), &Intent::Refund { amount_minor: 1 }, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::RefundExceedsCharged { refundable: 0, .. }
        ));
    }

    #[test]
    fn test_transfer_splits_collected_funds_once() {
        let b = step(
            &booking(10000),
            Intent::Charge {
                amount_minor: 10000,
                charge_ref: Some("ch_1".into()),
            },
        );
        let rate = FeeRate::from_bps(1000).unwrap();
        let t = apply(
            &b,
            &Intent::Transfer {
                fee_rate: rate,
                transfer_ref: Some("tr_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            t.movement,
            Some(Movement::Transfer {
                amount_minor: 10000,
                platform_fee_minor: 1000,
                net_minor: 9000,
            })
        );
        assert_eq!(
            t.booking.platform_fee_minor.unwrap() + t.booking.net_minor.unwrap(),
            t.booking.transferred_minor
        );

        let again = apply(
            &t.booking,
            &Intent::Transfer {
                fee_rate: rate,
                transfer_ref: Some("tr_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(again.outcome, Outcome::AlreadyApplied);
    }

    #[test]
    fn test_transfer_without_funds_conflicts() {
        let err = apply(
            &booking(100),
            &Intent::Transfer {
                fee_rate: FeeRate::zero(),
                transfer_ref: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_transfer_waits_for_full_rental_charge() {
        let partial = step(
            &booking(10000),
            Intent::Charge {
                amount_minor: 6000,
                charge_ref: Some("ch_1".into()),
            },
        );
        let err = apply(
            &partial,
            &Intent::Transfer {
                fee_rate: FeeRate::zero(),
                transfer_ref: None,
            },
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::RentalOutstanding { outstanding: 4000 });
        assert!(err.is_conflict());

        let full = step(
            &partial,
            Intent::Charge {
                amount_minor: 4000,
                charge_ref: Some("ch_2".into()),
            },
        );
        let t = apply(
            &full,
            &Intent::Transfer {
                fee_rate: FeeRate::from_bps(1250).unwrap(),
                transfer_ref: Some("tr_1".into()),
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            t.booking.platform_fee_minor.unwrap() + t.booking.net_minor.unwrap(),
            t.booking.total_minor
        );
    }

    #[test]
    fn test_charge_after_transfer_is_refused() {
        let paid = step(
            &step(
                &booking(10000),
                Intent::Charge {
                    amount_minor: 10000,
                    charge_ref: Some("ch_1".into()),
                },
            ),
            Intent::Transfer {
                fee_rate: FeeRate::zero(),
                transfer_ref: Some("tr_1".into()),
            },
        );
        let err = apply(
            &paid,
            &Intent::Charge {
                amount_minor: 1,
                charge_ref: Some("ch_2".into()),
            },
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::OverCollect { outstanding: 0, .. }));
    }

    #[test]
    fn test_booking_lifecycle() {
        let mut b = booking(100);
        for to in [
            BookingStatus::Confirmed,
            BookingStatus::PickedUp,
            BookingStatus::Active,
            BookingStatus::Returned,
            BookingStatus::Completed,
        ] {
            b = step(&b, Intent::Advance { to });
            assert_eq!(b.status, to);
        }

        assert!(!can_advance(BookingStatus::PickedUp, BookingStatus::Cancelled));
        assert!(!can_advance(BookingStatus::Active, BookingStatus::NoShow));
        assert!(can_advance(BookingStatus::Confirmed, BookingStatus::NoShow));
        assert!(!can_advance(BookingStatus::Pending, BookingStatus::Active));

        let err = apply(
            &b,
            &Intent::Advance {
                to: BookingStatus::Cancelled,
            },
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Cannot cancel booking in status Completed");
    }

    #[test]
    fn test_record_failure_leaves_state_untouched() {
        let b = booking(100);
        let t = apply(
            &b,
            &Intent::RecordFailure {
                payment_type: PaymentType::FullPayment,
                amount_minor: 100,
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.booking, b);
        assert!(matches!(
            t.movement,
            Some(Movement::Payment {
                status: PaymentStatus::Failed,
                ..
            })
        ));
    }

    #[test]
    fn test_transfer_status_machine() {
        use TransferStatus::*;
        assert_eq!(transfer_status_transition(Pending, Paid), Ok(Outcome::Applied));
        assert_eq!(transfer_status_transition(Paid, Reversed), Ok(Outcome::Applied));
        assert_eq!(transfer_status_transition(Paid, Paid), Ok(Outcome::AlreadyApplied));
        assert!(transfer_status_transition(Failed, Paid).is_err());
        assert!(transfer_status_transition(Reversed, Paid).is_err());
    }
}
