//! # Unit of Work
//!
//! One SQLite transaction, passed explicitly to every multi-statement write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         UnitOfWork lifecycle                            │
//! │                                                                         │
//! │  db.begin()                     BEGIN (deferred)                        │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  uow.lock_booking(t, id)        UPDATE bookings SET version+1  ← first │
//! │     │                           statement takes the write lock          │
//! │     ▼                                                                   │
//! │  reads / writes via uow.conn()  all on the same connection              │
//! │     │                                                                   │
//! │     ├── uow.commit()            COMMIT                                  │
//! │     └── drop(uow)               ROLLBACK                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Touching the booking row before reading it means the transaction holds
//! the write lock before it has a read snapshot, so two concurrent
//! transitions on one booking queue behind each other (via `busy_timeout`)
//! instead of one of them failing with a stale snapshot.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{DbError, DbResult};

/// RAII wrapper over a `sqlx::Transaction`.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub(crate) async fn begin(pool: &SqlitePool) -> DbResult<Self> {
        let tx = pool.begin().await?;
        Ok(UnitOfWork { tx })
    }

    /// The transaction's connection, for repository calls.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Takes the booking's write lock by bumping its version.
    ///
    /// Must be the first statement of the transaction. Fails with
    /// `NotFound` if the booking does not exist for this tenant.
    pub async fn lock_booking(&mut self, tenant_id: &str, booking_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE bookings SET version = version + 1 WHERE id = ?1 AND tenant_id = ?2",
        )
        .bind(booking_id)
        .bind(tenant_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Booking", booking_id));
        }

        debug!(booking_id, "Booking locked");
        Ok(())
    }

    pub async fn commit(self) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
