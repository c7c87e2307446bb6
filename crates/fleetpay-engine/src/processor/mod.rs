//! # Processor Gateway
//!
//! The engine's only door to the external payment processor.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SettlementService / ConnectManager                                    │
//! │       │  Arc<dyn ProcessorGateway>                                     │
//! │       ▼                                                                 │
//! │  RetryingGateway        per-call timeout, backoff on retryable errors  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  HttpProcessorClient    form-encoded REST, Idempotency-Key header      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Taxonomy
//!
//! | Error                 | Retry in gateway | Processor did it?        |
//! |-----------------------|------------------|--------------------------|
//! | `CardDeclined`        | no               | no                       |
//! | `InsufficientFunds`   | no               | no                       |
//! | `AccountRestricted`   | no               | no                       |
//! | `InvalidRequest`      | no               | no                       |
//! | `RateLimited`         | yes              | no                       |
//! | `Unavailable`         | yes (same key)   | maybe                    |
//! | `Timeout`             | no               | unknown                  |
//! | `MalformedResponse`   | no               | unknown                  |

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use fleetpay_core::account::AccountSnapshot;
use fleetpay_core::TransferStatus;

pub use http::HttpProcessorClient;
pub use retry::{RetryPolicy, RetryingGateway};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Card declined ({code}): {message}")]
    CardDeclined { code: String, message: String },

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Account restricted: {0}")]
    AccountRestricted(String),

    #[error("Rate limited by processor")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Processor unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No answer within the call timeout. The operation may or may not
    /// have happened.
    #[error("Processor call timed out")]
    Timeout,

    /// A success status with a body we could not read.
    #[error("Malformed processor response: {0}")]
    MalformedResponse(String),
}

impl ProcessorError {
    /// Failures worth retrying with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessorError::RateLimited { .. } | ProcessorError::Unavailable(_)
        )
    }

    /// Failures after which the processor may have performed the operation.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ProcessorError::Timeout
                | ProcessorError::MalformedResponse(_)
                | ProcessorError::Unavailable(_)
        )
    }

    /// The customer's card said no.
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            ProcessorError::CardDeclined { .. } | ProcessorError::InsufficientFunds
        )
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Whether a payment is collected now or only held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Charge immediately (rental charge).
    Automatic,
    /// Place a hold to capture later (security deposit).
    Manual,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Automatic => "automatic",
            CaptureMode::Manual => "manual",
        }
    }
}

/// Metadata attached to every processor object, echoed back in webhooks.
pub type Metadata = BTreeMap<String, String>;

/// Builds the standard metadata for a booking-scoped call.
pub fn booking_metadata(tenant_id: &str, booking_id: &str, idempotency_key: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("tenant_id".into(), tenant_id.into());
    metadata.insert("booking_id".into(), booking_id.into());
    metadata.insert("idempotency_key".into(), idempotency_key.into());
    metadata
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub idempotency_key: String,
    pub amount_minor: i64,
    pub currency: String,
    pub customer_id: String,
    /// Card or mandate to charge; the customer is not present.
    pub payment_method: String,
    pub capture_mode: CaptureMode,
    /// Tenant sub-account the charge is made on behalf of.
    pub on_behalf_of: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub idempotency_key: String,
    pub payment_intent_id: String,
    pub amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub idempotency_key: String,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub idempotency_key: String,
    pub payment_intent_id: String,
    pub amount_minor: i64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub idempotency_key: String,
    pub amount_minor: i64,
    pub currency: String,
    pub destination: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAccountRequest {
    pub idempotency_key: String,
    pub tenant_id: String,
    pub business_name: String,
    pub email: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingLinkRequest {
    pub account_id: String,
    pub return_url: String,
    pub refresh_url: String,
}

// =============================================================================
// Responses
// =============================================================================

/// A charge or hold as the processor sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub amount_minor: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub id: String,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingLink {
    pub url: String,
    pub expires_at: i64,
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// Operations the engine needs from a payment processor.
///
/// Every mutating call carries a deterministic idempotency key; the
/// processor collapses repeats of one key into the original operation.
#[async_trait]
pub trait ProcessorGateway: Send + Sync {
    /// Creates and confirms a payment. `CaptureMode::Manual` places a
    /// deposit hold.
    async fn charge(&self, req: &ChargeRequest) -> Result<PaymentIntent, ProcessorError>;

    /// Captures part or all of a hold.
    async fn capture(&self, req: &CaptureRequest) -> Result<PaymentIntent, ProcessorError>;

    /// Cancels a hold.
    async fn release(&self, req: &ReleaseRequest) -> Result<PaymentIntent, ProcessorError>;

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProcessorError>;

    /// Pays out to a tenant sub-account.
    async fn transfer(&self, req: &TransferRequest) -> Result<TransferReceipt, ProcessorError>;

    async fn create_sub_account(
        &self,
        req: &SubAccountRequest,
    ) -> Result<AccountSnapshot, ProcessorError>;

    async fn create_onboarding_link(
        &self,
        req: &OnboardingLinkRequest,
    ) -> Result<OnboardingLink, ProcessorError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<AccountSnapshot, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(ProcessorError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProcessorError::Unavailable("502".into()).is_retryable());
        assert!(!ProcessorError::Timeout.is_retryable());
        assert!(!ProcessorError::InsufficientFunds.is_retryable());

        assert!(ProcessorError::Timeout.is_ambiguous());
        assert!(!ProcessorError::InvalidRequest("x".into()).is_ambiguous());
        assert!(ProcessorError::InsufficientFunds.is_decline());
    }

    #[test]
    fn test_booking_metadata() {
        let m = booking_metadata("t1", "bk_1", "bk_1:charge:0+100");
        assert_eq!(m.get("booking_id").map(String::as_str), Some("bk_1"));
        assert_eq!(m.len(), 3);
    }
}
