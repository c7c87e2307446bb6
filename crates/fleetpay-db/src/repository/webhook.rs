//! # Webhook Event Repository
//!
//! Dedup and retry queue for processor events.
//!
//! ## Event Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  receive ──► upsert_pending ──► apply ──ok──► processed (archived)     │
//! │                   ▲               │                 │                   │
//! │                   │              err                ▼                   │
//! │                   │               │        purge_processed_before       │
//! │                   │               ▼                                     │
//! │                   └──── schedule_retry (retry_count+1, next_retry_at)   │
//! │                                   │                                     │
//! │                          retry_count ≥ max                              │
//! │                                   ▼                                     │
//! │                                failed ──► operator replay ──► pending   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::WebhookEvent;

macro_rules! webhook_columns {
    () => {
        r#"
        id, event_type, payload, status, retry_count, next_retry_at,
        error_message, note, received_at, processed_at
        "#
    };
}

/// Marks an event processed. Returns false if it already was.
pub(crate) async fn mark_processed<'e, E>(
    exec: E,
    id: &str,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE webhook_events SET
            status = 'processed',
            note = ?2,
            next_retry_at = NULL,
            processed_at = ?3
        WHERE id = ?1 AND status != 'processed'
        "#,
    )
    .bind(id)
    .bind(note)
    .bind(now)
    .execute(exec)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Repository for webhook events.
#[derive(Debug, Clone)]
pub struct WebhookRepository {
    pool: SqlitePool,
}

impl WebhookRepository {
    /// Creates a new WebhookRepository.
    pub fn new(pool: SqlitePool) -> Self {
        WebhookRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<WebhookEvent>> {
        let event = sqlx::query_as(concat!(
            "SELECT ",
            webhook_columns!(),
            " FROM webhook_events WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    /// Records a received event as `pending`, keeping any existing row.
    ///
    /// Returns the stored event, which may be an earlier delivery.
    pub async fn upsert_pending(
        &self,
        id: &str,
        event_type: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> DbResult<WebhookEvent> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (id, event_type, payload, status, retry_count, received_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(event_type)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(event_id = id, "Webhook event already recorded");
        }

        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("WebhookEvent", id))
    }

    /// Marks an event processed outside a unit of work.
    pub async fn mark_processed(&self, id: &str, note: Option<&str>, now: DateTime<Utc>) -> DbResult<bool> {
        mark_processed(&self.pool, id, note, now).await
    }

    /// Records a failed attempt and schedules the next one.
    pub async fn schedule_retry(
        &self,
        id: &str,
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events SET
                retry_count = ?2,
                next_retry_at = ?3,
                error_message = ?4
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gives up on an event; it waits in the operator queue.
    pub async fn mark_failed(&self, id: &str, retry_count: i64, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = 'failed',
                retry_count = ?2,
                next_retry_at = NULL,
                error_message = ?3
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Pending events whose retry is due, plus never-attempted events
    /// received before `stale_before` (left behind by a crash).
    ///
    /// Ordered by due time so one booking's events are retried in the
    /// order they were scheduled.
    pub async fn due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<WebhookEvent>> {
        let events = sqlx::query_as(concat!(
            "SELECT ",
            webhook_columns!(),
            r#"
            FROM webhook_events
            WHERE status = 'pending'
              AND ((next_retry_at IS NOT NULL AND next_retry_at <= ?1)
                   OR (next_retry_at IS NULL AND received_at <= ?2))
            ORDER BY COALESCE(next_retry_at, received_at), received_at
            LIMIT ?3
            "#
        ))
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// The operator queue: events that exhausted their retries.
    pub async fn list_failed(&self, limit: u32) -> DbResult<Vec<WebhookEvent>> {
        let events = sqlx::query_as(concat!(
            "SELECT ",
            webhook_columns!(),
            " FROM webhook_events WHERE status = 'failed' ORDER BY received_at LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Puts a failed (or stuck) event back to `pending` with a fresh retry
    /// budget. Processed events are left alone; returns whether anything
    /// was reset.
    pub async fn reset_for_replay(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = 'pending',
                retry_count = 0,
                next_retry_at = NULL,
                error_message = NULL
            WHERE id = ?1 AND status != 'processed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes processed events older than `cutoff`. Returns rows removed.
    pub async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE status = 'processed' AND processed_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use fleetpay_core::WebhookStatus;

    async fn repo() -> WebhookRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().webhooks()
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_delivery() {
        let repo = repo().await;
        let now = Utc::now();
        let first = repo.upsert_pending("evt_1", "charge.succeeded", "{}", now).await.unwrap();
        assert_eq!(first.status, WebhookStatus::Pending);

        repo.mark_processed("evt_1", None, now).await.unwrap();
        let second = repo
            .upsert_pending("evt_1", "charge.succeeded", "{\"x\":1}", now)
            .await
            .unwrap();
        assert_eq!(second.status, WebhookStatus::Processed);
        assert_eq!(second.payload, "{}");

        assert!(!repo.mark_processed("evt_1", None, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_schedule_and_failure_queue() {
        let repo = repo().await;
        let now = Utc::now();
        repo.upsert_pending("evt_1", "charge.refunded", "{}", now).await.unwrap();

        repo.schedule_retry("evt_1", 1, now + Duration::seconds(30), "db busy")
            .await
            .unwrap();
        assert!(repo.due(now, now - Duration::minutes(1), 10).await.unwrap().is_empty());

        let due = repo
            .due(now + Duration::seconds(31), now - Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);

        repo.mark_failed("evt_1", 8, "gave up").await.unwrap();
        let failed = repo.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("gave up"));

        assert!(repo.reset_for_replay("evt_1").await.unwrap());
        let event = repo.get("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_unattempted_events_are_due() {
        let repo = repo().await;
        let received = Utc::now() - Duration::minutes(5);
        repo.upsert_pending("evt_old", "charge.succeeded", "{}", received)
            .await
            .unwrap();

        let now = Utc::now();
        let due = repo.due(now, now - Duration::minutes(1), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "evt_old");
    }

    #[tokio::test]
    async fn test_purge_processed_before() {
        let repo = repo().await;
        let old = Utc::now() - Duration::days(40);
        repo.upsert_pending("evt_old", "x", "{}", old).await.unwrap();
        repo.mark_processed("evt_old", None, old).await.unwrap();
        repo.upsert_pending("evt_new", "x", "{}", Utc::now()).await.unwrap();
        repo.mark_processed("evt_new", None, Utc::now()).await.unwrap();
        repo.upsert_pending("evt_pending", "x", "{}", old).await.unwrap();

        let purged = repo
            .purge_processed_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get("evt_old").await.unwrap().is_none());
        assert!(repo.get("evt_new").await.unwrap().is_some());
        assert!(repo.get("evt_pending").await.unwrap().is_some());
    }
}
