//! # fleetpay-engine: Settlement Engine for FleetPay
//!
//! Drives booking money through the external payment processor on behalf of
//! many tenants and reconciles the processor's webhooks with locally
//! initiated calls.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   caller                              processor webhooks               │
//! │     │                                        │                          │
//! │     ▼                                        ▼                          │
//! │  ┌──────────────────┐               ┌──────────────────┐               │
//! │  │ SettlementService│               │ WebhookReconciler│◄── signature  │
//! │  │ gate, journal,   │               │ dedup, classify, │               │
//! │  │ call, apply      │               │ resolve, retry   │               │
//! │  └───┬──────────┬───┘               └────────┬─────────┘               │
//! │      │          │                            │                          │
//! │      ▼          │       ┌─────────────┐      │                          │
//! │  ProcessorGateway       │ Connect     │◄─────┤ account.updated          │
//! │  (retry + HTTP) │       │ Manager     │      │                          │
//! │                 ▼       └──────┬──────┘      ▼                          │
//! │           ┌──────────────────────────────────────────┐                 │
//! │           │  fleetpay-db ledger (state machine, 1 tx) │                 │
//! │           └──────────────────────────────────────────┘                 │
//! │                              ▲                                          │
//! │                              │ retry_due + reconcile_unknown_attempts   │
//! │                       SettlementWorker                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`error`] - Engine error taxonomy
//! - [`processor`] - Gateway trait, retrying wrapper, HTTP client
//! - [`settlement`] - Deposit, charge, refund and payout operations
//! - [`events`] - Processor webhook envelope
//! - [`signature`] - Webhook HMAC verification
//! - [`reconciler`] - Webhook processing, retries, operator queue
//! - [`connect`] - Tenant sub-account onboarding and sync
//! - [`worker`] - Background retry and reconciliation loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleetpay_engine::{EngineConfig, HttpProcessorClient, RetryingGateway, SettlementService};
//!
//! let config = EngineConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//! let http = Arc::new(HttpProcessorClient::new(&config.processor)?);
//! let gateway = Arc::new(RetryingGateway::new(http, RetryPolicy::from(&config.processor)));
//!
//! let settlement = SettlementService::new(db, gateway, &config.settlement);
//! settlement.authorize_deposit("tenant-1", &booking_id, 50_000, "pm_card_visa").await?;
//! settlement.capture_deposit("tenant-1", &booking_id, 7_500, Some("fuel")).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connect;
pub mod error;
pub mod events;
pub mod processor;
pub mod reconciler;
pub mod settlement;
pub mod signature;
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    ConfigError, DatabaseSettings, EngineConfig, ProcessorSettings, ServerSettings,
    SettlementSettings, WebhookSettings,
};
pub use connect::{BusinessInfo, ConnectManager};
pub use error::{EngineError, EngineResult, ErrorCategory};
pub use events::{EventKind, ProcessorEvent};
pub use processor::{
    HttpProcessorClient, ProcessorError, ProcessorGateway, RetryPolicy, RetryingGateway,
};
pub use reconciler::{RetryReport, WebhookOutcome, WebhookReconciler};
pub use settlement::{ReconcileReport, SettlementService};
pub use signature::{SignatureError, SIGNATURE_HEADER};
pub use worker::{SettlementWorker, TickReport, WorkerHandle};

pub use fleetpay_db::Applied;
