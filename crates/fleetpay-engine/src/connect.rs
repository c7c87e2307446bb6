//! # Connect Account Manager
//!
//! Owns every write to `tenant_accounts`.
//!
//! ```text
//!   create_sub_account ──► processor ──► snapshot ─┐
//!   refresh_from_processor ──► processor ──────────┤
//!   account.updated webhook ───────────────────────┴──► sync_from_processor
//!                                                          │ apply_snapshot
//!                                                          ▼
//!                                                    tenant_accounts
//! ```
//!
//! Flags are only ever taken from processor-confirmed snapshots.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::error::{EngineError, EngineResult};
use crate::processor::{OnboardingLink, OnboardingLinkRequest, ProcessorGateway, SubAccountRequest};
use fleetpay_core::account::{self, AccountSnapshot};
use fleetpay_core::validation::validate_id;
use fleetpay_core::{AccountStatus, FeeRate, TenantAccount, ValidationError};
use fleetpay_db::ledger;
use fleetpay_db::Database;

/// Details sent when opening a sub-account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessInfo {
    pub business_name: String,
    pub email: String,
    /// ISO 3166-1 alpha-2.
    pub country: String,
    pub platform_fee_bps: u32,
}

impl BusinessInfo {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.business_name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "business_name".into(),
            });
        }
        if !self.email.contains('@') {
            return Err(ValidationError::InvalidFormat {
                field: "email".into(),
                reason: "missing '@'".into(),
            });
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidFormat {
                field: "country".into(),
                reason: "expected a two-letter country code".into(),
            });
        }
        FeeRate::from_bps(self.platform_fee_bps)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConnectManager {
    db: Database,
    gateway: Arc<dyn ProcessorGateway>,
}

impl ConnectManager {
    pub fn new(db: Database, gateway: Arc<dyn ProcessorGateway>) -> Self {
        ConnectManager { db, gateway }
    }

    /// Opens a processor sub-account for `tenant_id`.
    ///
    /// A tenant that already has one gets it back unchanged.
    pub async fn create_sub_account(
        &self,
        tenant_id: &str,
        info: &BusinessInfo,
    ) -> EngineResult<TenantAccount> {
        validate_id("tenant_id", tenant_id)?;
        info.validate()?;

        let now = Utc::now();
        let mut account = match self.db.tenants().get(tenant_id).await? {
            Some(existing) if existing.processor_account_id.is_some() => {
                info!(tenant_id, "Sub-account already exists");
                return Ok(existing);
            }
            Some(existing) => existing,
            None => TenantAccount::new(tenant_id, info.platform_fee_bps, now),
        };

        let snapshot = self
            .gateway
            .create_sub_account(&SubAccountRequest {
                idempotency_key: format!("{}:sub-account:once", tenant_id),
                tenant_id: tenant_id.to_string(),
                business_name: info.business_name.trim().to_string(),
                email: info.email.trim().to_string(),
                country: info.country.to_uppercase(),
            })
            .await?;

        account.platform_fee_bps = info.platform_fee_bps;
        account::apply_snapshot(&mut account, &snapshot, now);
        ledger::save_account(&self.db, &account, None, now).await?;

        info!(
            tenant_id,
            processor_account_id = %snapshot.processor_account_id,
            "Sub-account created"
        );
        Ok(account)
    }

    /// Creates a hosted onboarding link for the tenant's sub-account.
    pub async fn onboarding_link(
        &self,
        tenant_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> EngineResult<OnboardingLink> {
        let return_url = validate_url("return_url", return_url)?;
        let refresh_url = validate_url("refresh_url", refresh_url)?;

        let account = self.load_account(tenant_id).await?;
        let account_id = account
            .processor_account_id
            .ok_or_else(|| EngineError::not_found("Sub-account", tenant_id))?;

        let link = self
            .gateway
            .create_onboarding_link(&OnboardingLinkRequest {
                account_id,
                return_url: return_url.to_string(),
                refresh_url: refresh_url.to_string(),
            })
            .await?;
        Ok(link)
    }

    pub async fn account_status(&self, tenant_id: &str) -> EngineResult<AccountStatus> {
        Ok(self
            .db
            .tenants()
            .get(tenant_id)
            .await?
            .map(|a| account::status_of(&a))
            .unwrap_or(AccountStatus::NotStarted))
    }

    /// Gate for charges and deposit holds. Unknown tenants cannot charge.
    pub async fn can_accept_charges(&self, tenant_id: &str) -> EngineResult<bool> {
        Ok(self
            .db
            .tenants()
            .get(tenant_id)
            .await?
            .is_some_and(|a| account::can_accept_charges(&a)))
    }

    /// Applies a processor snapshot to the tenant's account.
    ///
    /// When `webhook_event_id` is set the event is marked processed in the
    /// same transaction.
    pub async fn sync_from_processor(
        &self,
        tenant_id: &str,
        snapshot: &AccountSnapshot,
        webhook_event_id: Option<&str>,
    ) -> EngineResult<TenantAccount> {
        let mut account = self.load_account(tenant_id).await?;

        if let Some(existing) = account.processor_account_id.as_deref() {
            if existing != snapshot.processor_account_id {
                return Err(EngineError::Conflict(format!(
                    "tenant {} is linked to {}, not {}",
                    tenant_id, existing, snapshot.processor_account_id
                )));
            }
        }

        let before = account::status_of(&account);
        let now = Utc::now();
        account::apply_snapshot(&mut account, snapshot, now);
        ledger::save_account(&self.db, &account, webhook_event_id, now).await?;

        let after = account::status_of(&account);
        if after != before {
            info!(tenant_id, from = ?before, to = ?after, "Account status changed");
        }
        if after == AccountStatus::Restricted {
            warn!(
                tenant_id,
                past_due = ?account.requirements_past_due,
                charges_enabled = account.charges_enabled,
                "Account restricted"
            );
        }
        Ok(account)
    }

    /// Syncs the account owning `snapshot`, if any tenant owns it.
    pub async fn sync_by_processor_account(
        &self,
        snapshot: &AccountSnapshot,
        webhook_event_id: Option<&str>,
    ) -> EngineResult<Option<TenantAccount>> {
        let Some(owner) = self
            .db
            .tenants()
            .find_by_processor_account(&snapshot.processor_account_id)
            .await?
        else {
            return Ok(None);
        };
        self.sync_from_processor(&owner.tenant_id, snapshot, webhook_event_id)
            .await
            .map(Some)
    }

    /// Pulls a fresh snapshot from the processor and applies it.
    pub async fn refresh_from_processor(&self, tenant_id: &str) -> EngineResult<TenantAccount> {
        let account = self.load_account(tenant_id).await?;
        let account_id = account
            .processor_account_id
            .ok_or_else(|| EngineError::not_found("Sub-account", tenant_id))?;

        let snapshot = self.gateway.retrieve_account(&account_id).await?;
        self.sync_from_processor(tenant_id, &snapshot, None).await
    }

    async fn load_account(&self, tenant_id: &str) -> EngineResult<TenantAccount> {
        self.db
            .tenants()
            .get(tenant_id)
            .await?
            .ok_or_else(|| EngineError::not_found("TenantAccount", tenant_id))
    }
}

fn validate_url(field: &str, raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}
