//! # Money Codec
//!
//! Converts tenant-facing decimal amounts to and from the processor's
//! integer minor-unit representation.
//!
//! ## Why Minor Units?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Tenant sees           Ledger stores          Processor receives        │
//! │  ───────────           ─────────────          ──────────────────        │
//! │  500.00 USD   ──────►  50000 (i64)   ──────►  amount=50000              │
//! │  10000 JPY    ──────►  10000 (i64)   ──────►  amount=10000              │
//! │                                                                         │
//! │  JPY, KRW, CLP, VND ... have no minor unit: ×1, not ×100.              │
//! │  Getting this wrong charges a Tokyo customer 100× the price.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All arithmetic uses `rust_decimal`; binary floating point never touches
//! an amount.
//!
//! ## Usage
//! ```rust
//! use fleetpay_core::money::{from_minor_units, to_minor_units};
//! use rust_decimal::Decimal;
//! use std::str::FromStr;
//!
//! let usd = Decimal::from_str("500.00").unwrap();
//! assert_eq!(to_minor_units(usd, "usd").unwrap(), 50000);
//!
//! let yen = from_minor_units(10000, "JPY").unwrap();
//! assert_eq!(yen, Decimal::from(10000));
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MoneyError;

// =============================================================================
// Currency Table
// =============================================================================

/// Currencies whose minor unit equals the major unit.
const ZERO_DECIMAL: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Currencies with two decimal places that the platform settles in.
const TWO_DECIMAL: &[&str] = &[
    "AED", "AUD", "BGN", "BRL", "CAD", "CHF", "CZK", "DKK", "EUR", "GBP", "HKD", "HUF", "ILS",
    "INR", "MXN", "MYR", "NOK", "NZD", "PHP", "PLN", "RON", "SEK", "SGD", "THB", "TRY", "USD",
    "ZAR",
];

/// A supported ISO-4217 currency with its minor-unit exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Currency {
    code: &'static str,
    exponent: u32,
}

impl Currency {
    /// Looks up a currency code (case-insensitive).
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let upper = code.trim().to_ascii_uppercase();

        if let Some(code) = ZERO_DECIMAL.iter().find(|c| **c == upper) {
            return Ok(Currency {
                code: *code,
                exponent: 0,
            });
        }
        if let Some(code) = TWO_DECIMAL.iter().find(|c| **c == upper) {
            return Ok(Currency {
                code: *code,
                exponent: 2,
            });
        }

        Err(MoneyError::UnsupportedCurrency(code.to_string()))
    }

    /// Upper-case ISO code.
    #[inline]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Number of decimal places in the major unit (0 or 2).
    #[inline]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    #[inline]
    pub fn is_zero_decimal(&self) -> bool {
        self.exponent == 0
    }

    /// Converts a decimal amount into minor units.
    ///
    /// Sub-minor fractions are rounded half away from zero:
    /// `0.005 USD → 1`, `-0.005 USD → -1`, `100.5 JPY → 101`.
    pub fn to_minor(&self, amount: Decimal) -> Result<i64, MoneyError> {
        let overflow = || MoneyError::Overflow {
            amount: amount.to_string(),
            currency: self.code.to_string(),
        };

        let scaled = amount
            .checked_mul(Decimal::from(10_i64.pow(self.exponent)))
            .ok_or_else(overflow)?;

        scaled
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .ok_or_else(overflow)
    }

    /// Converts minor units back into a decimal amount (exact).
    #[inline]
    pub fn from_minor(&self, units: i64) -> Decimal {
        Decimal::new(units, self.exponent)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

// =============================================================================
// Codec Functions
// =============================================================================

/// Converts a decimal amount to the processor's minor units.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, MoneyError> {
    Currency::parse(currency)?.to_minor(amount)
}

/// Converts processor minor units back to a decimal amount.
pub fn from_minor_units(units: i64, currency: &str) -> Result<Decimal, MoneyError> {
    Ok(Currency::parse(currency)?.from_minor(units))
}

/// Renders minor units for logs and messages, e.g. `"500.00 USD"`.
///
/// Unknown currencies fall back to the raw minor units so a log line never
/// fails.
pub fn format_minor(units: i64, currency: &str) -> String {
    match Currency::parse(currency) {
        Ok(cur) => format!("{} {}", cur.from_minor(units), cur.code()),
        Err(_) => format!("{} {} (minor)", units, currency),
    }
}

// =============================================================================
// Money Value
// =============================================================================

/// An amount in minor units tagged with its currency code.
///
/// Used at the API boundary where amounts and currencies travel together;
/// the ledger itself stores the two columns separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(minor: i64, currency: impl Into<String>) -> Self {
        Money {
            minor,
            currency: currency.into(),
        }
    }

    /// Builds a `Money` from a tenant-facing decimal.
    pub fn from_decimal(amount: Decimal, currency: &str) -> Result<Self, MoneyError> {
        let cur = Currency::parse(currency)?;
        Ok(Money {
            minor: cur.to_minor(amount)?,
            currency: cur.code().to_string(),
        })
    }

    /// Returns the tenant-facing decimal amount.
    pub fn to_decimal(&self) -> Result<Decimal, MoneyError> {
        from_minor_units(self.minor, &self.currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_minor(self.minor, &self.currency))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
