//! # Booking Repository
//!
//! Settlement view of bookings: status, deposit sub-state, running totals.
//!
//! Bookings are created by the booking CRUD layer (out of this crate's
//! scope) through [`BookingRepository::insert`]. After that, only
//! [`crate::ledger`] writes to a booking row, always inside a
//! [`crate::UnitOfWork`] that locked it first.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleetpay_core::{Booking, BookingStatus, DepositStatus, SecurityDeposit};

macro_rules! booking_columns {
    () => {
        r#"
        id, tenant_id, customer_id, status, currency,
        total_minor, charged_minor, refunded_minor, transferred_minor,
        deposit_status, deposit_authorized_minor, deposit_captured_minor,
        deposit_released_remainder_minor, deposit_authorization_ref,
        deposit_generation, deposit_authorized_at, deposit_settled_at, deposit_reason,
        processor_charge_ref, processor_transfer_ref, platform_fee_minor, net_minor,
        version, created_at, updated_at
        "#
    };
}

/// Flat row; the deposit columns fold into [`SecurityDeposit`].
#[derive(Debug, sqlx::FromRow)]
struct BookingRow {
    id: String,
    tenant_id: String,
    customer_id: String,
    status: BookingStatus,
    currency: String,
    total_minor: i64,
    charged_minor: i64,
    refunded_minor: i64,
    transferred_minor: i64,
    deposit_status: DepositStatus,
    deposit_authorized_minor: i64,
    deposit_captured_minor: i64,
    deposit_released_remainder_minor: i64,
    deposit_authorization_ref: Option<String>,
    deposit_generation: i64,
    deposit_authorized_at: Option<DateTime<Utc>>,
    deposit_settled_at: Option<DateTime<Utc>>,
    deposit_reason: Option<String>,
    processor_charge_ref: Option<String>,
    processor_transfer_ref: Option<String>,
    platform_fee_minor: Option<i64>,
    net_minor: Option<i64>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BookingRow> for Booking {
    fn from(row: BookingRow) -> Self {
        Booking {
            id: row.id,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            status: row.status,
            currency: row.currency,
            total_minor: row.total_minor,
            charged_minor: row.charged_minor,
            refunded_minor: row.refunded_minor,
            transferred_minor: row.transferred_minor,
            deposit: SecurityDeposit {
                status: row.deposit_status,
                authorized_minor: row.deposit_authorized_minor,
                captured_minor: row.deposit_captured_minor,
                released_remainder_minor: row.deposit_released_remainder_minor,
                authorization_ref: row.deposit_authorization_ref,
                generation: row.deposit_generation,
                authorized_at: row.deposit_authorized_at,
                settled_at: row.deposit_settled_at,
                reason: row.deposit_reason,
            },
            processor_charge_ref: row.processor_charge_ref,
            processor_transfer_ref: row.processor_transfer_ref,
            platform_fee_minor: row.platform_fee_minor,
            net_minor: row.net_minor,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Tenant and booking id resolved from a processor reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingKey {
    pub tenant_id: String,
    pub booking_id: String,
}

// =============================================================================
// Executor-level queries (pool or unit of work)
// =============================================================================

pub(crate) async fn fetch<'e, E>(exec: E, tenant_id: &str, id: &str) -> DbResult<Option<Booking>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<BookingRow> = sqlx::query_as(concat!(
        "SELECT ",
        booking_columns!(),
        " FROM bookings WHERE id = ?1 AND tenant_id = ?2"
    ))
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(exec)
    .await?;

    Ok(row.map(Booking::from))
}

pub(crate) async fn insert<'e, E>(exec: E, booking: &Booking) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let d = &booking.deposit;
    sqlx::query(concat!(
        "INSERT INTO bookings (",
        booking_columns!(),
        r#") VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9,
            ?10, ?11, ?12,
            ?13, ?14,
            ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22,
            ?23, ?24, ?25
        )"#
    ))
    .bind(&booking.id)
    .bind(&booking.tenant_id)
    .bind(&booking.customer_id)
    .bind(booking.status)
    .bind(&booking.currency)
    .bind(booking.total_minor)
    .bind(booking.charged_minor)
    .bind(booking.refunded_minor)
    .bind(booking.transferred_minor)
    .bind(d.status)
    .bind(d.authorized_minor)
    .bind(d.captured_minor)
    .bind(d.released_remainder_minor)
    .bind(&d.authorization_ref)
    .bind(d.generation)
    .bind(d.authorized_at)
    .bind(d.settled_at)
    .bind(&d.reason)
    .bind(&booking.processor_charge_ref)
    .bind(&booking.processor_transfer_ref)
    .bind(booking.platform_fee_minor)
    .bind(booking.net_minor)
    .bind(booking.version)
    .bind(booking.created_at)
    .bind(booking.updated_at)
    .execute(exec)
    .await?;

    Ok(())
}

/// Writes the settlement state computed by the state machine.
///
/// `version` is not written; [`crate::UnitOfWork::lock_booking`] owns it.
pub(crate) async fn update_state<'e, E>(exec: E, booking: &Booking) -> DbResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let d = &booking.deposit;
    let result = sqlx::query(
        r#"
        UPDATE bookings SET
            status = ?3,
            charged_minor = ?4,
            refunded_minor = ?5,
            transferred_minor = ?6,
            deposit_status = ?7,
            deposit_authorized_minor = ?8,
            deposit_captured_minor = ?9,
            deposit_released_remainder_minor = ?10,
            deposit_authorization_ref = ?11,
            deposit_generation = ?12,
            deposit_authorized_at = ?13,
            deposit_settled_at = ?14,
            deposit_reason = ?15,
            processor_charge_ref = ?16,
            processor_transfer_ref = ?17,
            platform_fee_minor = ?18,
            net_minor = ?19,
            updated_at = ?20
        WHERE id = ?1 AND tenant_id = ?2
        "#,
    )
    .bind(&booking.id)
    .bind(&booking.tenant_id)
    .bind(booking.status)
    .bind(booking.charged_minor)
    .bind(booking.refunded_minor)
    .bind(booking.transferred_minor)
    .bind(d.status)
    .bind(d.authorized_minor)
    .bind(d.captured_minor)
    .bind(d.released_remainder_minor)
    .bind(&d.authorization_ref)
    .bind(d.generation)
    .bind(d.authorized_at)
    .bind(d.settled_at)
    .bind(&d.reason)
    .bind(&booking.processor_charge_ref)
    .bind(&booking.processor_transfer_ref)
    .bind(booking.platform_fee_minor)
    .bind(booking.net_minor)
    .bind(booking.updated_at)
    .execute(exec)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("Booking", &booking.id));
    }

    Ok(())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for booking reads and creation.
#[derive(Debug, Clone)]
pub struct BookingRepository {
    pool: SqlitePool,
}

impl BookingRepository {
    /// Creates a new BookingRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BookingRepository { pool }
    }

    /// Inserts a new booking (used by the booking CRUD layer and seeding).
    pub async fn insert(&self, booking: &Booking) -> DbResult<()> {
        debug!(id = %booking.id, tenant_id = %booking.tenant_id, "Inserting booking");
        insert(&self.pool, booking).await
    }

    /// Gets a booking by ID, scoped to its tenant.
    pub async fn get(&self, tenant_id: &str, id: &str) -> DbResult<Option<Booking>> {
        fetch(&self.pool, tenant_id, id).await
    }

    /// Like [`get`](Self::get) but fails with `NotFound`.
    pub async fn load(&self, tenant_id: &str, id: &str) -> DbResult<Booking> {
        self.get(tenant_id, id)
            .await?
            .ok_or_else(|| DbError::not_found("Booking", id))
    }

    /// Lists a tenant's bookings, newest first.
    pub async fn list_for_tenant(&self, tenant_id: &str, limit: u32) -> DbResult<Vec<Booking>> {
        let rows: Vec<BookingRow> = sqlx::query_as(concat!(
            "SELECT ",
            booking_columns!(),
            " FROM bookings WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Booking::from).collect())
    }

    /// Counts a tenant's bookings.
    pub async fn count_for_tenant(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookings WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Resolves the booking a processor object belongs to.
    ///
    /// ## Lookup Order
    /// 1. Deposit authorization, rental charge or payout reference on the booking
    /// 2. Ledger entries (movement reference, or the charge a refund refers to)
    /// 3. Settlement attempts (target or returned reference)
    pub async fn find_by_processor_ref(&self, reference: &str) -> DbResult<Option<BookingKey>> {
        let direct: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT tenant_id, id FROM bookings
            WHERE deposit_authorization_ref = ?1
               OR processor_charge_ref = ?1
               OR processor_transfer_ref = ?1
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((tenant_id, booking_id)) = direct {
            return Ok(Some(BookingKey {
                tenant_id,
                booking_id,
            }));
        }

        let indirect: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT tenant_id, booking_id FROM payment_records
            WHERE booking_id IS NOT NULL
              AND (processor_ref = ?1 OR processor_payment_id = ?1)
            UNION ALL
            SELECT tenant_id, booking_id FROM settlement_attempts
            WHERE processor_ref = ?1 OR target_ref = ?1
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(indirect.map(|(tenant_id, booking_id)| BookingKey {
            tenant_id,
            booking_id,
        }))
    }

    /// Resolves a booking by id alone (processor metadata carries no tenant).
    pub async fn find_key(&self, booking_id: &str) -> DbResult<Option<BookingKey>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT tenant_id, id FROM bookings WHERE id = ?1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(tenant_id, booking_id)| BookingKey {
            tenant_id,
            booking_id,
        }))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
