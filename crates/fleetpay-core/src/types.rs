//! # Domain Types
//!
//! Settlement entities shared by every FleetPay crate.
//!
//! ## Entity Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Settlement Entities                             │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Booking      │   │  PaymentRecord  │   │    Transfer     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │◄──│  booking_id     │   │  booking_id ───►│       │
//! │  │  tenant_id      │   │  amount (±)     │   │  fee + net      │       │
//! │  │  status         │   │  processor_ref  │   │  status         │       │
//! │  │  deposit {..}   │   │  (immutable)    │   │                 │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌───────────────────┐     │
//! │  │ TenantAccount   │   │  WebhookEvent   │   │ SettlementAttempt │     │
//! │  │  sub-account    │   │  dedup record   │   │ persist-before-   │     │
//! │  │  capabilities   │   │  retry state    │   │ call journal      │     │
//! │  └─────────────────┘   └─────────────────┘   └───────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entities reference each other by id only. Nothing here holds a pointer
//! to another entity; graphs are loaded per operation through explicit
//! lookups.
//!
//! All amounts are signed minor units (`*_minor: i64`) next to an ISO
//! currency code. See [`crate::money`] for conversion.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Booking Status
// =============================================================================

/// Booking lifecycle.
///
/// ```text
/// Pending ─► Confirmed ─► PickedUp ─► Active ─► Returned ─► Completed
///    │           │
///    └───────────┴──► Cancelled | NoShow
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    PickedUp,
    Active,
    Returned,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Returns true once the booking can no longer move.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::PickedUp => "picked_up",
            BookingStatus::Active => "active",
            BookingStatus::Returned => "returned",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

// =============================================================================
// Security Deposit
// =============================================================================

/// Security deposit sub-state.
///
/// `Captured` and `Released` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    #[default]
    Pending,
    Authorized,
    Captured,
    Released,
}

impl DepositStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Captured | DepositStatus::Released)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Authorized => "authorized",
            DepositStatus::Captured => "captured",
            DepositStatus::Released => "released",
        }
    }
}

/// The security deposit embedded in a booking.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityDeposit {
    pub status: DepositStatus,

    /// Amount currently (or last) held on the customer's card.
    pub authorized_minor: i64,

    /// Amount converted into a charge. Always `<= authorized_minor`.
    pub captured_minor: i64,

    /// Uncaptured part of the hold returned on a partial capture.
    pub released_remainder_minor: i64,

    /// Processor reference of the authorization (payment intent id).
    pub authorization_ref: Option<String>,

    /// Incremented on each (re-)authorization; scopes idempotency keys.
    pub generation: i64,

    pub authorized_at: Option<DateTime<Utc>>,

    /// When the deposit was captured or released.
    pub settled_at: Option<DateTime<Utc>>,

    /// Human-readable reason for capture or release ("fuel", "damage").
    pub reason: Option<String>,
}

impl SecurityDeposit {
    /// Read-time staleness check.
    ///
    /// Card authorizations expire at the processor after the hold window
    /// (typically 7 days). Nothing is written when a hold goes stale; the
    /// next capture or release simply refuses until it is re-authorized.
    pub fn is_stale(&self, now: DateTime<Utc>, hold_window: Duration) -> bool {
        match (self.status, self.authorized_at) {
            (DepositStatus::Authorized, Some(at)) => now - at > hold_window,
            _ => false,
        }
    }

    /// Amount still held and capturable.
    pub fn capturable_minor(&self) -> i64 {
        match self.status {
            DepositStatus::Authorized => self.authorized_minor,
            _ => 0,
        }
    }
}

// =============================================================================
// Booking
// =============================================================================

/// A booking and its settlement sub-state.
///
/// ## Running Totals
/// `charged_minor`, `refunded_minor` and `transferred_minor` are updated in
/// the same transaction that appends the matching [`PaymentRecord`] or
/// [`Transfer`], so they always equal the sums over those tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub status: BookingStatus,
    pub currency: String,

    /// Rental price in minor units.
    pub total_minor: i64,

    /// Gross rental charges collected (never decreases).
    pub charged_minor: i64,

    /// Gross refunds issued (rental and deposit).
    pub refunded_minor: i64,

    /// Amount paid out to the tenant.
    pub transferred_minor: i64,

    pub deposit: SecurityDeposit,

    /// Processor reference of the rental charge.
    pub processor_charge_ref: Option<String>,

    /// Processor reference of the payout transfer.
    pub processor_transfer_ref: Option<String>,

    pub platform_fee_minor: Option<i64>,
    pub net_minor: Option<i64>,

    /// Bumped by every ledger transition; the row touch doubles as the lock.
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Creates a new pending booking with no settlement activity.
    pub fn new(
        tenant_id: impl Into<String>,
        customer_id: impl Into<String>,
        total_minor: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Booking {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            customer_id: customer_id.into(),
            status: BookingStatus::Pending,
            currency: currency.into(),
            total_minor,
            charged_minor: 0,
            refunded_minor: 0,
            transferred_minor: 0,
            deposit: SecurityDeposit::default(),
            processor_charge_ref: None,
            processor_transfer_ref: None,
            platform_fee_minor: None,
            net_minor: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Everything successfully charged: rental plus captured deposit.
    pub fn gross_collected_minor(&self) -> i64 {
        self.charged_minor + self.deposit.captured_minor
    }

    /// What can still be refunded.
    pub fn refundable_minor(&self) -> i64 {
        self.gross_collected_minor() - self.refunded_minor
    }

    /// Rental balance not yet charged.
    pub fn outstanding_minor(&self) -> i64 {
        self.total_minor - self.charged_minor
    }
}

// =============================================================================
// Payment Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    FullPayment,
    Deposit,
    Refund,
}

/// Terminal status of a ledger entry.
///
/// Records are written once, already terminal: charges and deposit
/// captures as `Succeeded`, refunds as `Refunded`, declined attempts as
/// `Failed`. Failed entries never count towards running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Refunded,
}

/// Immutable ledger entry per money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PaymentRecord {
    pub id: String,
    /// None for standalone payments not tied to a booking.
    pub booking_id: Option<String>,
    pub tenant_id: String,
    pub payment_type: PaymentType,
    /// Signed: refunds are negative.
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Processor id of this movement (charge, refund or transfer id).
    pub processor_ref: Option<String>,
    /// For refunds: the charge being refunded.
    pub processor_payment_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

// =============================================================================
// Transfer
// =============================================================================

/// Payout status.
///
/// ```text
/// Pending ─► Paid ─► Reversed
///    │
///    ├────► Failed
///    └────► Reversed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Reversed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Paid => "paid",
            TransferStatus::Failed => "failed",
            TransferStatus::Reversed => "reversed",
        }
    }
}

/// One payout of a booking's funds to the tenant's sub-account.
///
/// Invariant: `amount_minor == platform_fee_minor + net_minor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Transfer {
    pub id: String,
    pub booking_id: String,
    pub tenant_id: String,
    pub amount_minor: i64,
    pub platform_fee_minor: i64,
    pub net_minor: i64,
    pub currency: String,
    pub destination_account: String,
    pub processor_transfer_id: Option<String>,
    pub status: TransferStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tenant Account
// =============================================================================

/// Coarse onboarding state derived from a [`TenantAccount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// No processor sub-account yet.
    NotStarted,
    /// Sub-account exists but onboarding is incomplete.
    Onboarding,
    /// Past-due requirements, or charges/payouts disabled.
    Restricted,
    Active,
}

/// A rental company's processor sub-account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAccount {
    pub tenant_id: String,
    pub processor_account_id: Option<String>,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub onboarding_complete: bool,
    pub requirements_currently_due: Vec<String>,
    pub requirements_eventually_due: Vec<String>,
    pub requirements_past_due: Vec<String>,
    /// Platform fee in basis points (1000 = 10%).
    pub platform_fee_bps: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantAccount {
    /// Creates an account record for a tenant that has not onboarded yet.
    pub fn new(tenant_id: impl Into<String>, platform_fee_bps: u32, now: DateTime<Utc>) -> Self {
        TenantAccount {
            tenant_id: tenant_id.into(),
            processor_account_id: None,
            charges_enabled: false,
            payouts_enabled: false,
            onboarding_complete: false,
            requirements_currently_due: Vec::new(),
            requirements_eventually_due: Vec::new(),
            requirements_past_due: Vec::new(),
            platform_fee_bps,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Webhook Event
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Received, not yet applied (or waiting for a retry).
    #[default]
    Pending,
    /// Applied or deliberately ignored. Terminal.
    Processed,
    /// Retries exhausted; waiting for an operator.
    Failed,
}

/// Dedup and retry record for one processor event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct WebhookEvent {
    /// Processor event id (unique).
    pub id: String,
    pub event_type: String,
    pub payload: String,
    pub status: WebhookStatus,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Why an event was processed without a ledger change.
    pub note: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Settlement Attempt
// =============================================================================

/// Which processor operation an attempt journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AttemptIntent {
    AuthorizeDeposit,
    CaptureDeposit,
    ReleaseDeposit,
    Charge,
    Refund,
    Transfer,
}

impl AttemptIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptIntent::AuthorizeDeposit => "deposit-authorize",
            AttemptIntent::CaptureDeposit => "deposit-capture",
            AttemptIntent::ReleaseDeposit => "deposit-release",
            AttemptIntent::Charge => "charge",
            AttemptIntent::Refund => "refund",
            AttemptIntent::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Journaled; the processor call has not returned yet.
    #[default]
    InFlight,
    Succeeded,
    Failed,
    /// The call timed out. Resolved later by webhook or reconciliation poll.
    Unknown,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InFlight => "in_flight",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Unknown => "unknown",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded | AttemptStatus::Failed)
    }
}

/// Persist-before-call journal entry for one caller-initiated processor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SettlementAttempt {
    /// Deterministic key also sent to the processor.
    pub idempotency_key: String,
    pub booking_id: String,
    pub tenant_id: String,
    pub intent: AttemptIntent,
    pub amount_minor: i64,
    pub currency: String,
    pub status: AttemptStatus,
    /// Processor object the call acts on (authorization or charge being
    /// captured/refunded), if any.
    pub target_ref: Option<String>,
    /// Processor id returned by the call.
    pub processor_ref: Option<String>,
    /// Card or mandate the call was made against, so a re-issue uses it too.
    pub payment_method_ref: Option<String>,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booking_defaults() {
        let now = Utc::now();
        let booking = Booking::new("tenant-1", "cust-1", 50000, "USD", now);
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.deposit.status, DepositStatus::Pending);
        assert_eq!(booking.outstanding_minor(), 50000);
        assert_eq!(booking.refundable_minor(), 0);
    }

    #[test]
    fn test_refundable_includes_captured_deposit() {
        let mut booking = Booking::new("t", "c", 10000, "USD", Utc::now());
        booking.charged_minor = 10000;
        booking.deposit.captured_minor = 2500;
        booking.refunded_minor = 500;
        assert_eq!(booking.gross_collected_minor(), 12500);
        assert_eq!(booking.refundable_minor(), 12000);
    }

    #[test]
    fn test_deposit_staleness_is_read_time() {
        let now = Utc::now();
        let mut deposit = SecurityDeposit {
            status: DepositStatus::Authorized,
            authorized_minor: 50000,
            authorized_at: Some(now - Duration::days(8)),
            ..Default::default()
        };
        assert!(deposit.is_stale(now, Duration::days(7)));

        deposit.authorized_at = Some(now - Duration::days(6));
        assert!(!deposit.is_stale(now, Duration::days(7)));

        // Terminal deposits are never stale
        deposit.status = DepositStatus::Captured;
        deposit.authorized_at = Some(now - Duration::days(30));
        assert!(!deposit.is_stale(now, Duration::days(7)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DepositStatus::Captured.is_terminal());
        assert!(DepositStatus::Released.is_terminal());
        assert!(!DepositStatus::Authorized.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(!BookingStatus::Active.is_terminal());
        assert!(AttemptStatus::Failed.is_terminal());
        assert!(!AttemptStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_status_strings_are_snake_case() {
        assert_eq!(BookingStatus::NoShow.as_str(), "no_show");
        assert_eq!(BookingStatus::PickedUp.as_str(), "picked_up");
        assert_eq!(AttemptIntent::CaptureDeposit.as_str(), "deposit-capture");
    }
}
