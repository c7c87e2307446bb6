//! # Validation Module
//!
//! Input checks run by the settlement service before any state is loaded or
//! any processor call is made.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE         ids, amounts, reasons, currencies        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: State machine       amount vs. authorized / charged / total  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite              UNIQUE processor_ref, CHECK, triggers    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fleetpay_core::validation::{validate_amount_minor, validate_reason};
//!
//! assert!(validate_amount_minor(7500).is_ok());
//! assert!(validate_amount_minor(0).is_err());
//! assert!(validate_reason(Some("fuel")).is_ok());
//! ```

use crate::error::ValidationError;
use crate::money::Currency;
use crate::{MAX_AMOUNT_MINOR, MAX_REASON_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates an identifier (tenant, booking, customer, processor ref).
///
/// ## Rules
/// - Must not be empty
/// - At most 255 characters
/// - Letters, digits, `-`, `_`, `:` and `.` only
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > 255 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 255,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, digits, '-', '_', ':' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates a money amount in minor units.
pub fn validate_amount_minor(amount_minor: i64) -> ValidationResult<()> {
    if amount_minor <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "amount".to_string(),
        });
    }

    if amount_minor > MAX_AMOUNT_MINOR {
        return Err(ValidationError::OutOfRange {
            field: "amount".to_string(),
            min: "1".to_string(),
            max: MAX_AMOUNT_MINOR.to_string(),
        });
    }

    Ok(())
}

/// Validates an optional capture/release/refund reason.
///
/// Returns the trimmed reason, or `None` for blank input.
pub fn validate_reason(reason: Option<&str>) -> ValidationResult<Option<String>> {
    let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    if reason.chars().count() > MAX_REASON_LEN {
        return Err(ValidationError::TooLong {
            field: "reason".to_string(),
            max: MAX_REASON_LEN,
        });
    }

    Ok(Some(reason.to_string()))
}

/// Validates and normalises a currency code (`"usd"` → `"USD"`).
pub fn validate_currency(code: &str) -> ValidationResult<String> {
    Currency::parse(code)
        .map(|c| c.code().to_string())
        .map_err(|_| ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: format!("unsupported currency '{}'", code),
        })
}
