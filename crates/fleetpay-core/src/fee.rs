//! # Platform-Fee Splitter
//!
//! Divides a collected amount between the platform and the tenant.
//!
//! ```text
//! total = 10000 (100.00 USD), fee = 12.50% (1250 bps)
//!
//!   platform_fee = round_half_away(10000 × 1250 / 10000) = 1250
//!   net          = 10000 − 1250                          = 8750
//!
//!   platform_fee + net == total, always
//! ```
//!
//! The net side is computed by subtraction so the two halves can never drift
//! apart by a rounding unit.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Basis points in 100%.
pub const MAX_FEE_BPS: u32 = 10_000;

/// Platform fee as basis points (1 bp = 0.01%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(u32);

impl FeeRate {
    /// Creates a fee rate from basis points, rejecting anything above 100%.
    pub fn from_bps(bps: u32) -> Result<Self, ValidationError> {
        if bps > MAX_FEE_BPS {
            return Err(ValidationError::OutOfRange {
                field: "platform_fee".to_string(),
                min: "0".to_string(),
                max: "100".to_string(),
            });
        }
        Ok(FeeRate(bps))
    }

    /// Creates a fee rate from a percentage with at most two decimals
    /// (`12.5` → 1250 bps).
    pub fn from_percentage(pct: Decimal) -> Result<Self, ValidationError> {
        let out_of_range = || ValidationError::OutOfRange {
            field: "platform_fee".to_string(),
            min: "0".to_string(),
            max: "100".to_string(),
        };

        if pct.is_sign_negative() || pct > Decimal::ONE_HUNDRED {
            return Err(out_of_range());
        }
        if pct.normalize().scale() > 2 {
            return Err(ValidationError::InvalidFormat {
                field: "platform_fee".to_string(),
                reason: "at most two decimal places".to_string(),
            });
        }

        let bps = (pct * Decimal::ONE_HUNDRED)
            .to_u32()
            .ok_or_else(out_of_range)?;
        FeeRate::from_bps(bps)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage.
    pub fn percentage(&self) -> Decimal {
        Decimal::new(i64::from(self.0), 2)
    }

    #[inline]
    pub const fn zero() -> Self {
        FeeRate(0)
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        FeeRate::zero()
    }
}

/// Result of [`split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub platform_fee_minor: i64,
    pub net_minor: i64,
}

/// Splits `total_minor` into platform fee and tenant net.
///
/// The fee is rounded half away from zero to a whole minor unit, which is
/// exactly rounding to the currency's precision.
pub fn split(total_minor: i64, rate: FeeRate) -> FeeSplit {
    let raw = Decimal::from(total_minor) * Decimal::from(rate.bps()) / Decimal::from(MAX_FEE_BPS);
    let platform_fee_minor = raw
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        // |fee| <= |total| because bps <= 10000, so this always fits
        .unwrap_or(total_minor);

    FeeSplit {
        platform_fee_minor,
        net_minor: total_minor - platform_fee_minor,
    }
}
