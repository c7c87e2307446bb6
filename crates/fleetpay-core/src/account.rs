//! # Connect Account Status
//!
//! Pure derivation of a tenant's onboarding status from processor snapshots.
//!
//! ```text
//!   no sub-account ───────────────────────────────► NotStarted
//!   past-due requirements, or onboarded but a
//!   capability switched off ──────────────────────► Restricted
//!   onboarding not complete ──────────────────────► Onboarding
//!   charges + payouts enabled ────────────────────► Active
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountStatus, TenantAccount};

/// Capabilities and requirements as reported by the processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub processor_account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    /// The processor's `details_submitted`.
    pub details_submitted: bool,
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub eventually_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
}

/// Applies a processor snapshot to an account record.
///
/// A past-due requirement forces `charges_enabled = false` no matter what
/// the snapshot claims.
pub fn apply_snapshot(account: &mut TenantAccount, snapshot: &AccountSnapshot, now: DateTime<Utc>) {
    let past_due = !snapshot.past_due.is_empty();

    account.processor_account_id = Some(snapshot.processor_account_id.clone());
    account.charges_enabled = snapshot.charges_enabled && !past_due;
    account.payouts_enabled = snapshot.payouts_enabled;
    account.onboarding_complete = snapshot.details_submitted && snapshot.currently_due.is_empty();
    account.requirements_currently_due = snapshot.currently_due.clone();
    account.requirements_eventually_due = snapshot.eventually_due.clone();
    account.requirements_past_due = snapshot.past_due.clone();
    account.last_synced_at = Some(now);
    account.updated_at = now;
}

/// Derives the coarse onboarding status.
pub fn status_of(account: &TenantAccount) -> AccountStatus {
    if account.processor_account_id.is_none() {
        return AccountStatus::NotStarted;
    }
    if !account.requirements_past_due.is_empty() {
        return AccountStatus::Restricted;
    }
    if !account.onboarding_complete {
        return AccountStatus::Onboarding;
    }
    if account.charges_enabled && account.payouts_enabled {
        AccountStatus::Active
    } else {
        AccountStatus::Restricted
    }
}

/// Gate for every charge and deposit authorization.
#[inline]
pub fn can_accept_charges(account: &TenantAccount) -> bool {
    account.processor_account_id.is_some()
        && account.charges_enabled
        && account.requirements_past_due.is_empty()
}

/// Gate for payouts.
#[inline]
pub fn can_receive_payouts(account: &TenantAccount) -> bool {
    account.processor_account_id.is_some() && account.payouts_enabled
}
