//! # Transfer Repository
//!
//! Payouts of collected booking funds to tenant sub-accounts. At most one
//! transfer exists per booking (`UNIQUE(booking_id)`).

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::{Transfer, TransferStatus};

macro_rules! transfer_columns {
    () => {
        r#"
        id, booking_id, tenant_id, amount_minor, platform_fee_minor, net_minor,
        currency, destination_account, processor_transfer_id, status,
        failure_code, failure_message, created_at, updated_at
        "#
    };
}

pub(crate) async fn insert<'e, E>(exec: E, transfer: &Transfer) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    debug!(
        id = %transfer.id,
        booking_id = %transfer.booking_id,
        amount_minor = transfer.amount_minor,
        "Inserting transfer"
    );

    sqlx::query(concat!(
        "INSERT INTO transfers (",
        transfer_columns!(),
        ") VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    ))
    .bind(&transfer.id)
    .bind(&transfer.booking_id)
    .bind(&transfer.tenant_id)
    .bind(transfer.amount_minor)
    .bind(transfer.platform_fee_minor)
    .bind(transfer.net_minor)
    .bind(&transfer.currency)
    .bind(&transfer.destination_account)
    .bind(&transfer.processor_transfer_id)
    .bind(transfer.status)
    .bind(&transfer.failure_code)
    .bind(&transfer.failure_message)
    .bind(transfer.created_at)
    .bind(transfer.updated_at)
    .execute(exec)
    .await?;

    Ok(())
}

pub(crate) async fn find_by_processor_id<'e, E>(
    exec: E,
    processor_transfer_id: &str,
) -> DbResult<Option<Transfer>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let transfer = sqlx::query_as(concat!(
        "SELECT ",
        transfer_columns!(),
        " FROM transfers WHERE processor_transfer_id = ?1"
    ))
    .bind(processor_transfer_id)
    .fetch_optional(exec)
    .await?;

    Ok(transfer)
}

/// Status change, guarded by the expected current status.
pub(crate) async fn update_status<'e, E>(
    exec: E,
    id: &str,
    from: TransferStatus,
    to: TransferStatus,
    failure_code: Option<&str>,
    failure_message: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE transfers SET
            status = ?3,
            failure_code = COALESCE(?4, failure_code),
            failure_message = COALESCE(?5, failure_message),
            updated_at = ?6
        WHERE id = ?1 AND status = ?2
        "#,
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(failure_code)
    .bind(failure_message)
    .bind(now)
    .execute(exec)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("Transfer", id));
    }

    Ok(())
}

/// Repository for transfer reads.
#[derive(Debug, Clone)]
pub struct TransferRepository {
    pool: SqlitePool,
}

impl TransferRepository {
    /// Creates a new TransferRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TransferRepository { pool }
    }

    /// The transfer of a booking, if any.
    pub async fn get_for_booking(&self, tenant_id: &str, booking_id: &str) -> DbResult<Option<Transfer>> {
        let transfer = sqlx::query_as(concat!(
            "SELECT ",
            transfer_columns!(),
            " FROM transfers WHERE tenant_id = ?1 AND booking_id = ?2"
        ))
        .bind(tenant_id)
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(transfer)
    }

    pub async fn find_by_processor_id(&self, processor_transfer_id: &str) -> DbResult<Option<Transfer>> {
        find_by_processor_id(&self.pool, processor_transfer_id).await
    }

    /// A tenant's transfers, newest first.
    pub async fn list_for_tenant(&self, tenant_id: &str, limit: u32) -> DbResult<Vec<Transfer>> {
        let transfers = sqlx::query_as(concat!(
            "SELECT ",
            transfer_columns!(),
            " FROM transfers WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(transfers)
    }
}
