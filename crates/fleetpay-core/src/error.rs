//! # Error Types
//!
//! Domain-specific error types for fleetpay-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fleetpay-core errors (this file)                                      │
//! │  ├── CoreError        - Umbrella for the three below                   │
//! │  ├── MoneyError       - Currency table / minor-unit conversion         │
//! │  ├── TransitionError  - Illegal or out-of-range settlement transition  │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fleetpay-db errors (separate crate)                                   │
//! │  └── DbError / LedgerError                                             │
//! │                                                                         │
//! │  fleetpay-engine errors                                                │
//! │  └── EngineError      - What settlement callers see                    │
//! │                                                                         │
//! │  Flow: TransitionError → LedgerError → EngineError → ApiError          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (amounts, states, ids)
//! 3. Expected business conditions are values, never panics

use thiserror::Error;

use crate::types::{BookingStatus, DepositStatus};

// =============================================================================
// Core Error
// =============================================================================

/// Umbrella error for everything fleetpay-core can reject.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Money Error
// =============================================================================

/// Errors raised by the money codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// Currency code is not in the supported table.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Converted amount does not fit in 64-bit minor units.
    #[error("Amount {amount} {currency} overflows minor units")]
    Overflow { amount: String, currency: String },
}

// =============================================================================
// Transition Error
// =============================================================================

/// Reasons the state machine refuses an intent.
///
/// ## Categories
/// ```text
/// Conflict   → the intent is not legal from the current state
///              (release after capture, charge on a cancelled booking)
/// Validation → the intent is legal but its payload is out of range
///              (capture more than authorized, refund more than charged)
/// Stale      → the authorization hold window has elapsed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Deposit intent not legal from the current deposit status.
    #[error("Cannot {intent} deposit in status {status:?}")]
    DepositConflict {
        intent: &'static str,
        status: DepositStatus,
    },

    /// Booking intent not legal from the current booking status.
    #[error("Cannot {intent} booking in status {status:?}")]
    BookingConflict {
        intent: &'static str,
        status: BookingStatus,
    },

    /// A different authorization is already holding funds.
    #[error("Deposit already authorized under {existing}")]
    AlreadyAuthorized { existing: String },

    /// Amount must be strictly positive.
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    /// Capture exceeds the authorized hold.
    #[error("Capture of {requested} exceeds authorized {authorized}")]
    ExceedsAuthorized { requested: i64, authorized: i64 },

    /// Rental charge would collect more than the booking total.
    #[error("Charge of {requested} exceeds outstanding balance {outstanding}")]
    OverCollect { requested: i64, outstanding: i64 },

    /// Refund would exceed what has actually been charged.
    #[error("Refund of {requested} exceeds refundable {refundable}")]
    RefundExceedsCharged { requested: i64, refundable: i64 },

    /// Nothing collected, or already paid out.
    #[error("Nothing to transfer: collected {collected}, already transferred {transferred}")]
    NothingToTransfer { collected: i64, transferred: i64 },

    /// Payout requested before the rental is fully charged.
    #[error("Rental balance of {outstanding} still outstanding; transfer after full collection")]
    RentalOutstanding { outstanding: i64 },

    /// Authorization is older than the processor hold window.
    #[error("Authorization is stale; re-authorize before capture or release")]
    StaleAuthorization,

    /// Transfer status change not allowed.
    #[error("Transfer cannot move from {from} to {to}")]
    TransferConflict { from: String, to: String },
}

impl TransitionError {
    /// Returns true when the intent is illegal from the current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TransitionError::DepositConflict { .. }
                | TransitionError::BookingConflict { .. }
                | TransitionError::AlreadyAuthorized { .. }
                | TransitionError::NothingToTransfer { .. }
                | TransitionError::RentalOutstanding { .. }
                | TransitionError::TransferConflict { .. }
        )
    }

    /// Returns true when the payload itself is out of range.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransitionError::NonPositiveAmount(_)
                | TransitionError::ExceedsAuthorized { .. }
                | TransitionError::OverCollect { .. }
                | TransitionError::RefundExceedsCharged { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any state is loaded or any processor call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: String, max: String },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid URL, invalid identifier).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
