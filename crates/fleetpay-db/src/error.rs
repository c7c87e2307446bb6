//! # Database Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)          TransitionError (fleetpay-core)   │
//! │       │                                      │                          │
//! │       ▼                                      │                          │
//! │  DbError (duplicate / busy / corrupt / ...)  │                          │
//! │       │                                      │                          │
//! │       └──────────────┬───────────────────────┘                          │
//! │                      ▼                                                  │
//! │  LedgerError (apply_transition)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError (fleetpay-engine) ← What settlement callers see           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use fleetpay_core::TransitionError;
use thiserror::Error;

/// Storage failures, classified so callers can tell a duplicate or a busy
/// database from a real fault.
#[derive(Debug, Error)]
pub enum DbError {
    /// Missing row, or a booking owned by another tenant.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A processor reference or transfer that is already recorded.
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Rejected by a CHECK or by the append-only triggers on ledger rows.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The write lock stayed taken past `busy_timeout`.
    #[error("Database is busy")]
    Busy,

    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// A stored column that no longer decodes into its domain type.
    #[error("Corrupt {field}: {reason}")]
    Corrupt { field: String, reason: String },

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Busy and pool exhaustion clear on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Busy | DbError::PoolExhausted)
    }

    fn from_sqlite_message(msg: &str) -> Self {
        if let Some(field) = msg.strip_prefix("UNIQUE constraint failed: ") {
            return DbError::UniqueViolation {
                field: field.to_string(),
                value: "unknown".to_string(),
            };
        }
        if msg.starts_with("FOREIGN KEY constraint failed") {
            return DbError::ForeignKeyViolation(msg.to_string());
        }
        if msg.starts_with("CHECK constraint failed") || msg.contains("immutable") {
            return DbError::ConstraintViolation(msg.to_string());
        }
        if msg.contains("database is locked") || msg.contains("database is busy") {
            return DbError::Busy;
        }
        DbError::QueryFailed(msg.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),
            sqlx::Error::Database(db_err) => DbError::from_sqlite_message(db_err.message()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Ledger Error
// =============================================================================

/// Errors from [`crate::ledger::apply_transition`].
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The state machine refused the intent. Nothing was written.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Db(#[from] DbError),

    /// The command lacks a field the movement needs.
    #[error("Transition command is missing {0}")]
    Incomplete(&'static str),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Db(err.into())
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
