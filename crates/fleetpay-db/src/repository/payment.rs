//! # Payment Record Repository
//!
//! The append-only money ledger.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  payment_records                                                        │
//! │                                                                         │
//! │  full_payment  +10000  succeeded  pi_rent      ─┐                      │
//! │  deposit        +7500  succeeded  pi_dep        ├─ Σ = booking totals   │
//! │  refund         -2500  refunded   re_1 (pi_rent)─┘                      │
//! │  full_payment   +3000  failed     -             ← never counted        │
//! │                                                                         │
//! │  INSERT only. A trigger aborts every UPDATE.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::{PaymentRecord, PaymentStatus, PaymentType};

macro_rules! payment_columns {
    () => {
        r#"
        id, booking_id, tenant_id, payment_type, amount_minor, currency, status,
        processor_ref, processor_payment_id, idempotency_key, reason, processed_at
        "#
    };
}

// =============================================================================
// Executor-level queries
// =============================================================================

pub(crate) async fn insert<'e, E>(exec: E, record: &PaymentRecord) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    debug!(
        id = %record.id,
        booking_id = ?record.booking_id,
        payment_type = ?record.payment_type,
        amount_minor = record.amount_minor,
        "Appending payment record"
    );

    sqlx::query(concat!(
        "INSERT INTO payment_records (",
        payment_columns!(),
        ") VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    ))
    .bind(&record.id)
    .bind(&record.booking_id)
    .bind(&record.tenant_id)
    .bind(record.payment_type)
    .bind(record.amount_minor)
    .bind(&record.currency)
    .bind(record.status)
    .bind(&record.processor_ref)
    .bind(&record.processor_payment_id)
    .bind(&record.idempotency_key)
    .bind(&record.reason)
    .bind(record.processed_at)
    .execute(exec)
    .await?;

    Ok(())
}

pub(crate) async fn find_by_processor_ref<'e, E>(
    exec: E,
    processor_ref: &str,
) -> DbResult<Option<PaymentRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let record = sqlx::query_as(concat!(
        "SELECT ",
        payment_columns!(),
        " FROM payment_records WHERE processor_ref = ?1"
    ))
    .bind(processor_ref)
    .fetch_optional(exec)
    .await?;

    Ok(record)
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for ledger reads.
///
/// Writes happen only through [`crate::ledger`].
#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    /// Creates a new PaymentRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PaymentRepository { pool }
    }

    /// Gets a record by ID, scoped to its tenant.
    pub async fn get(&self, tenant_id: &str, id: &str) -> DbResult<Option<PaymentRecord>> {
        let record = sqlx::query_as(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payment_records WHERE id = ?1 AND tenant_id = ?2"
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Like [`get`](Self::get) but fails with `NotFound`.
    pub async fn load(&self, tenant_id: &str, id: &str) -> DbResult<PaymentRecord> {
        self.get(tenant_id, id)
            .await?
            .ok_or_else(|| DbError::not_found("PaymentRecord", id))
    }

    /// Finds the record for a processor movement id.
    pub async fn find_by_processor_ref(&self, processor_ref: &str) -> DbResult<Option<PaymentRecord>> {
        find_by_processor_ref(&self.pool, processor_ref).await
    }

    /// All records of a booking in processing order.
    pub async fn list_for_booking(
        &self,
        tenant_id: &str,
        booking_id: &str,
    ) -> DbResult<Vec<PaymentRecord>> {
        let records = sqlx::query_as(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payment_records WHERE tenant_id = ?1 AND booking_id = ?2 ORDER BY processed_at, rowid"
        ))
        .bind(tenant_id)
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Sum of a booking's terminal entries of one type and status.
    pub async fn sum(
        &self,
        tenant_id: &str,
        booking_id: &str,
        payment_type: PaymentType,
        status: PaymentStatus,
    ) -> DbResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount_minor) FROM payment_records
            WHERE tenant_id = ?1 AND booking_id = ?2 AND payment_type = ?3 AND status = ?4
            "#,
        )
        .bind(tenant_id)
        .bind(booking_id)
        .bind(payment_type)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.unwrap_or(0))
    }

    /// Refunds already issued against one charge (positive number).
    pub async fn refunded_against(&self, tenant_id: &str, processor_payment_id: &str) -> DbResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(-amount_minor) FROM payment_records
            WHERE tenant_id = ?1 AND processor_payment_id = ?2
              AND payment_type = 'refund' AND status = 'refunded'
            "#,
        )
        .bind(tenant_id)
        .bind(processor_payment_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.unwrap_or(0))
    }
}
