//! # Tenant Account Repository
//!
//! Processor sub-accounts of rental companies. Requirement lists are
//! stored as JSON arrays in TEXT columns.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::TenantAccount;

macro_rules! account_columns {
    () => {
        r#"
        tenant_id, processor_account_id, charges_enabled, payouts_enabled,
        onboarding_complete, requirements_currently_due, requirements_eventually_due,
        requirements_past_due, platform_fee_bps, last_synced_at, created_at, updated_at
        "#
    };
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    tenant_id: String,
    processor_account_id: Option<String>,
    charges_enabled: bool,
    payouts_enabled: bool,
    onboarding_complete: bool,
    requirements_currently_due: String,
    requirements_eventually_due: String,
    requirements_past_due: String,
    platform_fee_bps: u32,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for TenantAccount {
    type Error = DbError;

    fn try_from(row: AccountRow) -> DbResult<Self> {
        Ok(TenantAccount {
            tenant_id: row.tenant_id,
            processor_account_id: row.processor_account_id,
            charges_enabled: row.charges_enabled,
            payouts_enabled: row.payouts_enabled,
            onboarding_complete: row.onboarding_complete,
            requirements_currently_due: decode_list(
                "requirements_currently_due",
                &row.requirements_currently_due,
            )?,
            requirements_eventually_due: decode_list(
                "requirements_eventually_due",
                &row.requirements_eventually_due,
            )?,
            requirements_past_due: decode_list("requirements_past_due", &row.requirements_past_due)?,
            platform_fee_bps: row.platform_fee_bps,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_list(field: &str, raw: &str) -> DbResult<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| DbError::Corrupt {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn encode_list(list: &[String]) -> DbResult<String> {
    serde_json::to_string(list).map_err(|e| DbError::Internal(e.to_string()))
}

/// Inserts or fully replaces an account row.
pub(crate) async fn upsert<'e, E>(exec: E, account: &TenantAccount) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    debug!(
        tenant_id = %account.tenant_id,
        charges_enabled = account.charges_enabled,
        payouts_enabled = account.payouts_enabled,
        "Saving tenant account"
    );

    sqlx::query(concat!(
        "INSERT INTO tenant_accounts (",
        account_columns!(),
        r#") VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT (tenant_id) DO UPDATE SET
            processor_account_id = excluded.processor_account_id,
            charges_enabled = excluded.charges_enabled,
            payouts_enabled = excluded.payouts_enabled,
            onboarding_complete = excluded.onboarding_complete,
            requirements_currently_due = excluded.requirements_currently_due,
            requirements_eventually_due = excluded.requirements_eventually_due,
            requirements_past_due = excluded.requirements_past_due,
            platform_fee_bps = excluded.platform_fee_bps,
            last_synced_at = excluded.last_synced_at,
            updated_at = excluded.updated_at
        "#
    ))
    .bind(&account.tenant_id)
    .bind(&account.processor_account_id)
    .bind(account.charges_enabled)
    .bind(account.payouts_enabled)
    .bind(account.onboarding_complete)
    .bind(encode_list(&account.requirements_currently_due)?)
    .bind(encode_list(&account.requirements_eventually_due)?)
    .bind(encode_list(&account.requirements_past_due)?)
    .bind(account.platform_fee_bps)
    .bind(account.last_synced_at)
    .bind(account.created_at)
    .bind(account.updated_at)
    .execute(exec)
    .await?;

    Ok(())
}

pub(crate) async fn fetch<'e, E>(exec: E, tenant_id: &str) -> DbResult<Option<TenantAccount>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<AccountRow> = sqlx::query_as(concat!(
        "SELECT ",
        account_columns!(),
        " FROM tenant_accounts WHERE tenant_id = ?1"
    ))
    .bind(tenant_id)
    .fetch_optional(exec)
    .await?;

    row.map(TenantAccount::try_from).transpose()
}

/// Repository for tenant processor accounts.
#[derive(Debug, Clone)]
pub struct TenantRepository {
    pool: SqlitePool,
}

impl TenantRepository {
    /// Creates a new TenantRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TenantRepository { pool }
    }

    pub async fn get(&self, tenant_id: &str) -> DbResult<Option<TenantAccount>> {
        fetch(&self.pool, tenant_id).await
    }

    /// Like [`get`](Self::get) but fails with `NotFound`.
    pub async fn load(&self, tenant_id: &str) -> DbResult<TenantAccount> {
        self.get(tenant_id)
            .await?
            .ok_or_else(|| DbError::not_found("TenantAccount", tenant_id))
    }

    /// Inserts or replaces an account outside a unit of work.
    pub async fn save(&self, account: &TenantAccount) -> DbResult<()> {
        upsert(&self.pool, account).await
    }

    /// Looks up the tenant owning a processor sub-account.
    pub async fn find_by_processor_account(
        &self,
        processor_account_id: &str,
    ) -> DbResult<Option<TenantAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(concat!(
            "SELECT ",
            account_columns!(),
            " FROM tenant_accounts WHERE processor_account_id = ?1"
        ))
        .bind(processor_account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantAccount::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_account_round_trips_requirement_lists() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut account = TenantAccount::new("tenant-1", 1250, Utc::now());
        account.processor_account_id = Some("acct_1".into());
        account.requirements_past_due = vec!["external_account".into(), "tos_acceptance".into()];
        db.tenants().save(&account).await.unwrap();

        let loaded = db.tenants().load("tenant-1").await.unwrap();
        assert_eq!(loaded.requirements_past_due, account.requirements_past_due);
        assert_eq!(loaded.platform_fee_bps, 1250);

        let by_acct = db
            .tenants()
            .find_by_processor_account("acct_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_acct.tenant_id, "tenant-1");
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut account = TenantAccount::new("tenant-1", 1000, Utc::now());
        db.tenants().save(&account).await.unwrap();

        account.charges_enabled = true;
        account.platform_fee_bps = 500;
        db.tenants().save(&account).await.unwrap();

        let loaded = db.tenants().load("tenant-1").await.unwrap();
        assert!(loaded.charges_enabled);
        assert_eq!(loaded.platform_fee_bps, 500);
        assert!(db.tenants().get("tenant-2").await.unwrap().is_none());
    }
}
