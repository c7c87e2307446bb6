//! # fleetpay-core: Pure Settlement Logic for FleetPay
//!
//! Everything that decides *what* should happen to a booking's money lives
//! here, as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       FleetPay Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │         settlement-api (webhooks)  /  booking CRUD layer        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     fleetpay-engine: settlement service, reconciler, gateway    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ fleetpay-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────────┐ ┌──────────┐ ┌──────────────┐ │   │
//! │  │   │  money   │ │state_machine │ │   fee    │ │   account    │ │   │
//! │  │   │  codec   │ │  transitions │ │  split   │ │   status     │ │   │
//! │  │   └──────────┘ └──────────────┘ └──────────┘ └──────────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                fleetpay-db (Settlement Ledger)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Bookings, deposits, ledger entries, accounts
//! - [`money`] - Decimal ⇄ minor-unit codec
//! - [`state_machine`] - `(state, intent, ctx) -> Transition`
//! - [`fee`] - Platform-fee splitter
//! - [`account`] - Connect account status derivation
//! - [`idempotency`] - Processor idempotency keys
//! - [`validation`] - Input checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use fleetpay_core::state_machine::{apply, Intent, TransitionContext};
//! use fleetpay_core::{Booking, DepositStatus};
//!
//! let now = Utc::now();
//! let booking = Booking::new("tenant-1", "cust-1", 20000, "USD", now);
//! let ctx = TransitionContext::at(now);
//!
//! let held = apply(
//!     &booking,
//!     &Intent::AuthorizeDeposit { amount_minor: 50000, authorization_ref: None },
//!     &ctx,
//! )
//! .unwrap();
//! assert_eq!(held.booking.deposit.status, DepositStatus::Authorized);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod account;
pub mod error;
pub mod fee;
pub mod idempotency;
pub mod money;
pub mod state_machine;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, MoneyError, TransitionError, ValidationError};
pub use fee::{FeeRate, FeeSplit};
pub use money::{from_minor_units, to_minor_units, Currency, Money};
pub use state_machine::{Intent, Movement, Outcome, Transition, TransitionContext};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default card authorization hold window.
///
/// Card networks drop uncaptured authorizations after roughly a week.
pub const DEFAULT_HOLD_WINDOW_DAYS: i64 = 7;

/// Largest single amount accepted, in minor units.
pub const MAX_AMOUNT_MINOR: i64 = 9_999_999_999;

/// Maximum length of a capture/release/refund reason.
pub const MAX_REASON_LEN: usize = 500;
