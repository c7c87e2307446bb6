//! # Engine Error Types
//!
//! What settlement callers, the webhook endpoint and the worker see.
//!
//! ## Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      EngineError::category()                            │
//! │                                                                         │
//! │  Validation  bad input: amounts, ids, currencies, payloads, signatures  │
//! │  Conflict    intent illegal from the current state                      │
//! │  Transient   try again later with the same request                      │
//! │  Permanent   the processor or the tenant account said no                │
//! │  Unknown     the processor may have acted; resolved by webhook/poll     │
//! │  Internal    storage or configuration broke                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::processor::ProcessorError;
use crate::signature::SignatureError;
use fleetpay_core::{MoneyError, TransitionError, ValidationError};
use fleetpay_db::{DbError, LedgerError};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse error class used for retry decisions and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Transient,
    Permanent,
    Unknown,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Input Errors
    // =========================================================================
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    // =========================================================================
    // State Errors
    // =========================================================================
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Another call for the same operation is running or already failed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tenant {0} cannot accept charges")]
    ChargesDisabled(String),

    #[error("Tenant {0} cannot receive payouts")]
    PayoutsDisabled(String),

    // =========================================================================
    // Processor Errors
    // =========================================================================
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// The call may have gone through. The attempt stays `unknown` until a
    /// webhook or the reconcile poll settles it.
    #[error("Processor outcome unknown for {idempotency_key}")]
    OutcomeUnknown { idempotency_key: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Validation(_)
            | EngineError::Money(_)
            | EngineError::NotFound { .. }
            | EngineError::InvalidPayload(_)
            | EngineError::Signature(_) => ErrorCategory::Validation,

            EngineError::Transition(e) if e.is_validation() => ErrorCategory::Validation,
            EngineError::Transition(_) | EngineError::Conflict(_) => ErrorCategory::Conflict,

            EngineError::ChargesDisabled(_) | EngineError::PayoutsDisabled(_) => {
                ErrorCategory::Permanent
            }

            EngineError::Processor(e) if e.is_retryable() => ErrorCategory::Transient,
            EngineError::Processor(ProcessorError::Timeout)
            | EngineError::Processor(ProcessorError::MalformedResponse(_))
            | EngineError::OutcomeUnknown { .. } => ErrorCategory::Unknown,
            EngineError::Processor(_) => ErrorCategory::Permanent,

            EngineError::Db(e) if e.is_retryable() => ErrorCategory::Transient,
            EngineError::Db(DbError::NotFound { .. }) => ErrorCategory::Validation,
            EngineError::Db(_) | EngineError::Config(_) | EngineError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Transition(e) => EngineError::Transition(e),
            LedgerError::Db(DbError::NotFound { entity, id }) => EngineError::NotFound { entity, id },
            LedgerError::Db(e) => EngineError::Db(e),
            LedgerError::Incomplete(field) => {
                EngineError::Internal(format!("transition command is missing {}", field))
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetpay_core::DepositStatus;

    #[test]
    fn test_categories() {
        let conflict = EngineError::Transition(TransitionError::DepositConflict {
            intent: "release",
            status: DepositStatus::Captured,
        });
        assert_eq!(conflict.category(), ErrorCategory::Conflict);

        let over = EngineError::Transition(TransitionError::ExceedsAuthorized {
            requested: 60000,
            authorized: 50000,
        });
        assert_eq!(over.category(), ErrorCategory::Validation);

        assert_eq!(
            EngineError::Processor(ProcessorError::RateLimited { retry_after: None }).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EngineError::Processor(ProcessorError::InsufficientFunds).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            EngineError::OutcomeUnknown {
                idempotency_key: "bk:charge:0+1".into()
            }
            .category(),
            ErrorCategory::Unknown
        );
        assert!(EngineError::Db(DbError::Busy).is_retryable());
    }

    #[test]
    fn test_ledger_not_found_maps_to_not_found() {
        let err: EngineError = LedgerError::Db(DbError::not_found("Booking", "bk_1")).into();
        assert!(matches!(err, EngineError::NotFound { ref id, .. } if id == "bk_1"));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
