//! # Idempotency Keys
//!
//! Deterministic keys sent with every mutating processor call.
//!
//! ```text
//!   {booking_id}:{intent}:{scope}
//!
//!   bk_42:deposit-authorize:g1        first hold
//!   bk_42:deposit-authorize:g2        renewal after the hold went stale
//!   bk_42:deposit-capture:g2          capture of the renewed hold
//!   bk_42:charge:0+6000               first partial charge
//!   bk_42:charge:6000+4000            second partial charge
//!   bk_42:refund:pay_7:0+2500         first refund against payment pay_7
//!   bk_42:transfer:once               the single payout
//! ```
//!
//! The scope is derived from booking state *before* the call, so retrying
//! the same request against unchanged state yields the same key, and the
//! processor collapses the retry into the original operation.

use crate::types::{AttemptIntent, Booking};

/// Builds `{booking}:{intent}:{scope}`.
pub fn key(booking_id: &str, intent: AttemptIntent, scope: &str) -> String {
    format!("{}:{}:{}", booking_id, intent.as_str(), scope)
}

/// Key for authorizing (or renewing) the deposit hold.
pub fn authorize_key(booking: &Booking) -> String {
    key(
        &booking.id,
        AttemptIntent::AuthorizeDeposit,
        &format!("g{}", booking.deposit.generation + 1),
    )
}

/// Key for capturing the current hold.
pub fn capture_key(booking: &Booking) -> String {
    key(
        &booking.id,
        AttemptIntent::CaptureDeposit,
        &format!("g{}", booking.deposit.generation),
    )
}

/// Key for releasing the current hold.
pub fn release_key(booking: &Booking) -> String {
    key(
        &booking.id,
        AttemptIntent::ReleaseDeposit,
        &format!("g{}", booking.deposit.generation),
    )
}

/// Key for a rental charge of `amount_minor` on top of what is already charged.
pub fn charge_key(booking: &Booking, amount_minor: i64) -> String {
    key(
        &booking.id,
        AttemptIntent::Charge,
        &format!("{}+{}", booking.charged_minor, amount_minor),
    )
}

/// Key for refunding `amount_minor` of payment record `payment_id`.
pub fn refund_key(booking: &Booking, payment_id: &str, amount_minor: i64) -> String {
    key(
        &booking.id,
        AttemptIntent::Refund,
        &format!("{}:{}+{}", payment_id, booking.refunded_minor, amount_minor),
    )
}

/// Key for the booking's single payout.
pub fn transfer_key(booking: &Booking) -> String {
    key(&booking.id, AttemptIntent::Transfer, "once")
}

/// Extracts the booking id from a key, if it has the expected shape.
///
/// Used to match processor events carrying the key in their metadata.
pub fn booking_id_of(key: &str) -> Option<&str> {
    let mut parts = key.splitn(3, ':');
    let booking = parts.next().filter(|b| !b.is_empty())?;
    let _intent = parts.next()?;
    let _scope = parts.next()?;
    Some(booking)
}
