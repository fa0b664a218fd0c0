//! Append-only cancellation log backed by `PostgreSQL`.

use crate::ride_store::parse_status;
use ride_dispatch_core::cancellation::{CancellationLog, CancellationReason, CancellationRecord};
use ride_dispatch_core::store::{RideStoreError, StoreFuture};
use ride_dispatch_core::types::{DriverId, Party, PassengerId, RideId, Role};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Stores at most one row per ride and canceller, applied or not.
#[derive(Clone, Debug)]
pub struct PostgresCancellationLog {
    pool: PgPool,
}

impl PostgresCancellationLog {
    /// Create a log on an existing pool. Run [`crate::migrate`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, record: CancellationRecord) -> Result<CancellationRecord, RideStoreError> {
        let inserted = sqlx::query(
            r"
            INSERT INTO ride_cancellations (
                id, ride_id, canceller_id, canceller_role, reason, free_text,
                status_at_cancel, driver_at_cancel, applied, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (ride_id, canceller_id) DO NOTHING
            ",
        )
        .bind(record.id)
        .bind(record.ride_id.as_uuid())
        .bind(record.canceller.as_uuid())
        .bind(record.canceller.role().as_str())
        .bind(record.reason.as_str())
        .bind(&record.free_text)
        .bind(record.status_at_cancel.as_str())
        .bind(record.driver_at_cancel.map(|driver| *driver.as_uuid()))
        .bind(record.applied)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RideStoreError::Database(e.to_string()))?
        .rows_affected();

        if inserted == 0 {
            let earlier = self.by_canceller(&record).await?;
            tracing::debug!(
                ride_id = %record.ride_id,
                canceller = %record.canceller,
                "Canceller already on record, entry not appended"
            );
            return Ok(earlier);
        }

        tracing::info!(
            ride_id = %record.ride_id,
            canceller = %record.canceller,
            reason = record.reason.as_str(),
            applied = record.applied,
            "Cancellation recorded"
        );
        metrics::counter!(
            "cancellation_log_appended_total",
            "applied" => if record.applied { "true" } else { "false" }
        )
        .increment(1);

        Ok(record)
    }

    async fn by_canceller(&self, record: &CancellationRecord) -> Result<CancellationRecord, RideStoreError> {
        let row = sqlx::query(
            r"
            SELECT id, ride_id, canceller_id, canceller_role, reason, free_text,
                   status_at_cancel, driver_at_cancel, applied, recorded_at
            FROM ride_cancellations
            WHERE ride_id = $1 AND canceller_id = $2
            ",
        )
        .bind(record.ride_id.as_uuid())
        .bind(record.canceller.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RideStoreError::Database(e.to_string()))?;

        record_from_row(&row)
    }

    async fn for_ride(&self, ride_id: RideId) -> Result<Vec<CancellationRecord>, RideStoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, ride_id, canceller_id, canceller_role, reason, free_text,
                   status_at_cancel, driver_at_cancel, applied, recorded_at
            FROM ride_cancellations
            WHERE ride_id = $1
            ORDER BY seq ASC
            ",
        )
        .bind(ride_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RideStoreError::Database(e.to_string()))?;

        rows.iter().map(record_from_row).collect()
    }
}

impl CancellationLog for PostgresCancellationLog {
    fn append(&self, record: CancellationRecord) -> StoreFuture<'_, CancellationRecord> {
        Box::pin(self.insert(record))
    }

    fn list_for_ride(&self, ride_id: RideId) -> StoreFuture<'_, Vec<CancellationRecord>> {
        Box::pin(self.for_ride(ride_id))
    }
}

fn record_from_row(row: &PgRow) -> Result<CancellationRecord, RideStoreError> {
    let decode = |e: sqlx::Error| RideStoreError::Serialization(e.to_string());

    let canceller_id: Uuid = row.try_get("canceller_id").map_err(decode)?;
    let role: String = row.try_get("canceller_role").map_err(decode)?;
    let canceller = match role.parse::<Role>().map_err(RideStoreError::Serialization)? {
        Role::Passenger => Party::Passenger(PassengerId::from_uuid(canceller_id)),
        Role::Driver => Party::Driver(DriverId::from_uuid(canceller_id)),
    };
    let reason: String = row.try_get("reason").map_err(decode)?;
    let status: String = row.try_get("status_at_cancel").map_err(decode)?;
    let driver_at_cancel: Option<Uuid> = row.try_get("driver_at_cancel").map_err(decode)?;

    Ok(CancellationRecord {
        id: row.try_get("id").map_err(decode)?,
        ride_id: RideId::from_uuid(row.try_get("ride_id").map_err(decode)?),
        canceller,
        reason: reason
            .parse::<CancellationReason>()
            .map_err(RideStoreError::Serialization)?,
        free_text: row.try_get("free_text").map_err(decode)?,
        status_at_cancel: parse_status(&status)?,
        driver_at_cancel: driver_at_cancel.map(DriverId::from_uuid),
        applied: row.try_get("applied").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}
