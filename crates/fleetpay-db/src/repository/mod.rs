//! # Repository Module
//!
//! Database repositories for the settlement ledger.
//!
//! ## Two Access Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Reads / standalone writes            Ledger transitions                │
//! │  ─────────────────────────            ───────────────────               │
//! │  db.bookings().get(t, id)             let mut uow = db.begin().await?;  │
//! │  db.webhooks().list_failed(50)        uow.lock_booking(t, id).await?;   │
//! │       │                               booking::fetch(uow.conn(), ..)    │
//! │       ▼                               payment::insert(uow.conn(), ..)   │
//! │  SqlitePool                           uow.commit().await?;              │
//! │                                                                         │
//! │  Each module's SQL is written once, generic over `sqlx::Executor`,     │
//! │  and shared by both paths.                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`BookingRepository`](booking::BookingRepository) - Booking lookup and creation
//! - [`PaymentRepository`](payment::PaymentRepository) - Append-only ledger reads
//! - [`TransferRepository`](transfer::TransferRepository) - Tenant payouts
//! - [`TenantRepository`](tenant::TenantRepository) - Processor sub-accounts
//! - [`WebhookRepository`](webhook::WebhookRepository) - Event dedup and retry queue
//! - [`AttemptRepository`](attempt::AttemptRepository) - Persist-before-call journal

pub mod attempt;
pub mod booking;
pub mod payment;
pub mod tenant;
pub mod transfer;
pub mod webhook;
