//! # Settlement Attempt Repository
//!
//! Persist-before-call journal of caller-initiated processor calls.
//!
//! ```text
//!   begin()             INSERT status=in_flight        ← before the call
//!      │
//!      ├── processor ok        ──► ledger finalises as succeeded (same tx)
//!      ├── processor declined  ──► mark_failed
//!      └── processor timeout   ──► mark_unknown ──► webhook / reconcile poll
//! ```
//!
//! The primary key is the idempotency key, so two callers racing to start
//! the same operation cannot both journal it. A booking also holds at most
//! one unsettled attempt: while one is `in_flight` or `unknown`, a new key
//! for that booking is refused.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::{AttemptStatus, SettlementAttempt};

macro_rules! attempt_columns {
    () => {
        r#"
        idempotency_key, booking_id, tenant_id, intent, amount_minor, currency,
        status, target_ref, processor_ref, payment_method_ref, reason, error,
        created_at, updated_at
        "#
    };
}

/// Result of [`AttemptRepository::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginAttempt {
    /// Journaled; the caller owns the processor call.
    Started,
    /// Another attempt with this key already exists.
    Existing(SettlementAttempt),
    /// Another key on the same booking has not settled; nothing was written.
    Blocked(SettlementAttempt),
}

/// Marks an attempt succeeded with the processor's reference.
pub(crate) async fn mark_succeeded<'e, E>(
    exec: E,
    idempotency_key: &str,
    processor_ref: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE settlement_attempts SET
            status = 'succeeded',
            processor_ref = COALESCE(?2, processor_ref),
            error = NULL,
            updated_at = ?3
        WHERE idempotency_key = ?1 AND status != 'succeeded'
        "#,
    )
    .bind(idempotency_key)
    .bind(processor_ref)
    .bind(now)
    .execute(exec)
    .await?;

    Ok(())
}

/// Repository for settlement attempts.
#[derive(Debug, Clone)]
pub struct AttemptRepository {
    pool: SqlitePool,
}

impl AttemptRepository {
    /// Creates a new AttemptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        AttemptRepository { pool }
    }

    /// Journals an attempt unless one with the same key exists or the
    /// booking already has an unsettled attempt under another key.
    ///
    /// The pending check is part of the INSERT and the follow-up reads share
    /// its transaction.
    pub async fn begin(&self, attempt: &SettlementAttempt) -> DbResult<BeginAttempt> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(concat!(
            "INSERT INTO settlement_attempts (",
            attempt_columns!(),
            r#") SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
            WHERE NOT EXISTS (
                SELECT 1 FROM settlement_attempts
                WHERE booking_id = ?2
                  AND idempotency_key != ?1
                  AND status IN ('in_flight', 'unknown')
            )
            ON CONFLICT (idempotency_key) DO NOTHING"#
        ))
        .bind(&attempt.idempotency_key)
        .bind(&attempt.booking_id)
        .bind(&attempt.tenant_id)
        .bind(attempt.intent)
        .bind(attempt.amount_minor)
        .bind(&attempt.currency)
        .bind(attempt.status)
        .bind(&attempt.target_ref)
        .bind(&attempt.processor_ref)
        .bind(&attempt.payment_method_ref)
        .bind(&attempt.reason)
        .bind(&attempt.error)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            tx.commit().await?;
            debug!(idempotency_key = %attempt.idempotency_key, "Attempt journaled");
            return Ok(BeginAttempt::Started);
        }

        let existing: Option<SettlementAttempt> = sqlx::query_as(concat!(
            "SELECT ",
            attempt_columns!(),
            " FROM settlement_attempts WHERE idempotency_key = ?1"
        ))
        .bind(&attempt.idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.commit().await?;
            return Ok(BeginAttempt::Existing(existing));
        }

        let pending: Option<SettlementAttempt> = sqlx::query_as(concat!(
            "SELECT ",
            attempt_columns!(),
            r#"
            FROM settlement_attempts
            WHERE booking_id = ?1 AND status IN ('in_flight', 'unknown')
            ORDER BY created_at
            LIMIT 1
            "#
        ))
        .bind(&attempt.booking_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let pending = pending.ok_or_else(|| {
            DbError::Internal(format!(
                "attempt {} was neither journaled nor blocked",
                attempt.idempotency_key
            ))
        })?;
        debug!(
            idempotency_key = %attempt.idempotency_key,
            pending = %pending.idempotency_key,
            "Attempt blocked by an unsettled call"
        );
        Ok(BeginAttempt::Blocked(pending))
    }

    pub async fn get(&self, idempotency_key: &str) -> DbResult<Option<SettlementAttempt>> {
        let attempt = sqlx::query_as(concat!(
            "SELECT ",
            attempt_columns!(),
            " FROM settlement_attempts WHERE idempotency_key = ?1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempt)
    }

    /// Number of failed attempts under `base_key` or its retry suffixes.
    ///
    /// Used to derive a fresh key after a declined call, since the
    /// processor would replay the cached decline for the old key.
    pub async fn count_failed(&self, base_key: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM settlement_attempts
            WHERE status = 'failed'
              AND (idempotency_key = ?1 OR idempotency_key LIKE ?1 || '/r%')
            "#,
        )
        .bind(base_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Records a permanent processor failure.
    pub async fn mark_failed(&self, idempotency_key: &str, error: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.set_status(idempotency_key, AttemptStatus::Failed, Some(error), now)
            .await
    }

    /// Records a call whose outcome is unknown (timeout).
    pub async fn mark_unknown(&self, idempotency_key: &str, error: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.set_status(idempotency_key, AttemptStatus::Unknown, Some(error), now)
            .await
    }

    /// Succeeds an attempt outside a unit of work (no ledger change needed).
    pub async fn mark_succeeded(
        &self,
        idempotency_key: &str,
        processor_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        mark_succeeded(&self.pool, idempotency_key, processor_ref, now).await
    }

    async fn set_status(
        &self,
        idempotency_key: &str,
        status: AttemptStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE settlement_attempts SET status = ?2, error = ?3, updated_at = ?4
            WHERE idempotency_key = ?1 AND status IN ('in_flight', 'unknown')
            "#,
        )
        .bind(idempotency_key)
        .bind(status)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Attempts whose outcome is still unknown, oldest first.
    ///
    /// In-flight attempts older than `stale_before` are included too; their
    /// caller died before recording anything.
    pub async fn list_unresolved(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<SettlementAttempt>> {
        let attempts = sqlx::query_as(concat!(
            "SELECT ",
            attempt_columns!(),
            r#"
            FROM settlement_attempts
            WHERE status = 'unknown'
               OR (status = 'in_flight' AND updated_at <= ?1)
            ORDER BY created_at
            LIMIT ?2
            "#
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    /// A booking's attempts, oldest first.
    pub async fn list_for_booking(
        &self,
        tenant_id: &str,
        booking_id: &str,
    ) -> DbResult<Vec<SettlementAttempt>> {
        let attempts = sqlx::query_as(concat!(
            "SELECT ",
            attempt_columns!(),
            " FROM settlement_attempts WHERE tenant_id = ?1 AND booking_id = ?2 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }
}
