//! # fleetpay-db: Settlement Ledger for FleetPay
//!
//! SQLite storage for bookings, the append-only payment ledger, tenant
//! payouts, and the webhook and attempt journals.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       FleetPay Data Flow                                │
//! │                                                                         │
//! │  SettlementService / Reconciler (fleetpay-engine)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   fleetpay-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │    Ledger     │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │  (ledger.rs)  │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ BookingRepo   │    │              │  │   │
//! │  │   │ UnitOfWork    │───►│ PaymentRepo   │    │ 001_settle-  │  │   │
//! │  │   │ state machine │    │ WebhookRepo   │    │ ment_schema  │  │   │
//! │  │   │ dedup by ref  │    │ AttemptRepo   │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database and ledger error types
//! - [`unit_of_work`] - One transaction passed to every multi-statement write
//! - [`ledger`] - Applying state-machine transitions atomically
//! - [`repository`] - Per-table reads and standalone writes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleetpay_db::{ledger, Database, DbConfig, TransitionCommand};
//!
//! let db = Database::new(DbConfig::new("fleetpay.db")).await?;
//!
//! let cmd = TransitionCommand::new("tenant-1", booking_id, intent)
//!     .processor_ref(Some("pi_123".into()));
//! let applied = ledger::apply_transition(&db, &cmd, &ctx).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ledger;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod unit_of_work;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult, LedgerError, LedgerResult};
pub use ledger::{Applied, TransferUpdate, TransitionCommand};
pub use pool::{Database, DbConfig};
pub use unit_of_work::UnitOfWork;

// Repository re-exports for convenience
pub use repository::attempt::{AttemptRepository, BeginAttempt};
pub use repository::booking::{BookingKey, BookingRepository};
pub use repository::payment::PaymentRepository;
pub use repository::tenant::TenantRepository;
pub use repository::transfer::TransferRepository;
pub use repository::webhook::WebhookRepository;
