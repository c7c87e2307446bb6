//! # Database Migrations
//!
//! Schema files live in `migrations/sqlite/` at the workspace root and are
//! compiled into the binary. Applied files are immutable: schema changes go
//! in a new `NNN_description.sql`.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies every migration not yet recorded in `_sqlx_migrations`.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    info!(
        migrations = MIGRATOR.migrations.len(),
        "Ledger schema up to date"
    );
    Ok(())
}

/// Number of embedded migrations the database has not recorded.
pub async fn pending(pool: &SqlitePool) -> DbResult<usize> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?;
    Ok(MIGRATOR.migrations.len().saturating_sub(applied as usize))
}
