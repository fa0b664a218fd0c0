//! `PostgreSQL` ride request store.
//!
//! A conditional update is a single `UPDATE … WHERE <predicate> RETURNING`
//! statement, so the check and the write are atomic under row-level locking
//! without an explicit transaction. Zero affected rows is followed by one
//! read to tell `NotFound` from `Conflict`.

use crate::schema::{CHANGE_CHANNEL, ONE_LIVE_RIDE_INDEX};
use futures::stream;
use ride_dispatch_core::environment::{Clock, SystemClock};
use ride_dispatch_core::geo::Polyline;
use ride_dispatch_core::ride::{DriverExpectation, RidePatch, RidePredicate, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::store::{
    ChangeFeed, ChangeNotice, ChangeStream, RideChange, RideRequestStore, RideStoreError,
    StoreFuture, validate_new, validate_write,
};
use ride_dispatch_core::types::{
    CorrelationId, DriverId, Location, Money, Party, PassengerId, RideId, ServiceCategory,
};
use ride_dispatch_runtime::metrics::{StoreMetrics, UpdateOutcome};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Postgres error code for a violated CHECK constraint
const CHECK_VIOLATION: &str = "23514";

/// Postgres error code for a violated unique constraint or index
const UNIQUE_VIOLATION: &str = "23505";

/// Columns selected and returned for every ride query
const RIDE_COLUMNS: &str = "id, created_at, passenger_id, rider_name, rider_phone, driver_id, \
     released_driver_id, origin_lat, origin_lng, origin_address, destination_lat, destination_lng, \
     destination_address, service_category, estimated_fare_cents, actual_fare_cents, status, \
     accepted_at, driver_arrived_at_origin_at, trip_started_at, \
     driver_arrived_at_destination_at, completed_at, updated_at, version, route_to_origin, \
     route_to_destination, correlation_id";

/// `PostgreSQL`-backed [`RideRequestStore`] and [`ChangeFeed`].
///
/// # Example
///
/// ```no_run
/// use ride_dispatch_postgres::PostgresRideStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresRideStore::new("postgres://localhost/rides", 10).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresRideStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresRideStore {
    /// Connect with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`RideStoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, RideStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| RideStoreError::Database(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool; `updated_at` comes from the system clock.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Wrap an existing pool with a custom clock
    #[must_use]
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the change trigger.
    ///
    /// # Errors
    ///
    /// Returns [`RideStoreError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), RideStoreError> {
        crate::schema::migrate(&self.pool).await
    }

    async fn insert(&self, ride: RideRequest) -> Result<RideRequest, RideStoreError> {
        validate_new(&ride)?;

        let query = format!(
            r"
            INSERT INTO ride_requests (
                id, created_at, passenger_id, rider_name, rider_phone, driver_id,
                origin_lat, origin_lng, origin_address,
                destination_lat, destination_lng, destination_address,
                service_category, estimated_fare_cents, actual_fare_cents, status,
                updated_at, version, correlation_id
            ) VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, $9, $10, $11, $12, $13, NULL, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            RETURNING {RIDE_COLUMNS}
            "
        );

        let row = sqlx::query(&query)
            .bind(ride.id.as_uuid())
            .bind(ride.created_at)
            .bind(ride.passenger_id.as_uuid())
            .bind(&ride.rider_name)
            .bind(&ride.rider_phone)
            .bind(ride.origin.lat)
            .bind(ride.origin.lng)
            .bind(&ride.origin.address)
            .bind(ride.destination.lat)
            .bind(ride.destination.lng)
            .bind(&ride.destination.address)
            .bind(ride.service_category.as_str())
            .bind(ride.estimated_fare.cents())
            .bind(ride.status.as_str())
            .bind(ride.updated_at)
            .bind(to_db_version(ride.version)?)
            .bind(ride.correlation_id.map(|id| *id.as_uuid()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                if violates_unique(&error, ONE_LIVE_RIDE_INDEX) {
                    RideStoreError::LiveRideExists(ride.passenger_id)
                } else {
                    db_error(error)
                }
            })?;

        let Some(row) = row else {
            return Err(RideStoreError::AlreadyExists(ride.id));
        };
        let created = ride_from_row(&row)?;
        tracing::debug!(ride_id = %created.id, "Ride request inserted");
        Ok(created)
    }

    async fn update(
        &self,
        id: RideId,
        expected: &RidePredicate,
        patch: &RidePatch,
    ) -> Result<RideRequest, RideStoreError> {
        validate_write(expected, patch)?;

        let statuses: Vec<&str> = expected
            .statuses()
            .iter()
            .filter(|status| !status.is_terminal())
            .map(|status| status.as_str())
            .collect();
        let (require_unassigned, expected_driver) = match expected.driver() {
            DriverExpectation::Any => (false, None),
            DriverExpectation::Unassigned => (true, None),
            DriverExpectation::Is(driver) => (false, Some(*driver.as_uuid())),
        };

        let query = format!(
            r"
            UPDATE ride_requests SET
                status = COALESCE($5, status),
                driver_id = CASE WHEN $16 THEN NULL ELSE COALESCE($6, driver_id) END,
                released_driver_id = CASE WHEN $16 THEN driver_id ELSE released_driver_id END,
                accepted_at = COALESCE($7, accepted_at),
                driver_arrived_at_origin_at = COALESCE($8, driver_arrived_at_origin_at),
                trip_started_at = COALESCE($9, trip_started_at),
                driver_arrived_at_destination_at = COALESCE($10, driver_arrived_at_destination_at),
                completed_at = COALESCE($11, completed_at),
                actual_fare_cents = COALESCE($12, actual_fare_cents),
                route_to_origin = COALESCE($13, route_to_origin),
                route_to_destination = COALESCE($14, route_to_destination),
                updated_at = $15,
                version = version + 1
            WHERE id = $1
              AND status = ANY($2)
              AND ($3 = FALSE OR driver_id IS NULL)
              AND ($4::uuid IS NULL OR driver_id = $4)
            RETURNING {RIDE_COLUMNS}
            "
        );

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(&statuses)
            .bind(require_unassigned)
            .bind(expected_driver)
            .bind(patch.status.map(RideStatus::as_str))
            .bind(patch.driver_id.map(|d| *d.as_uuid()))
            .bind(patch.accepted_at)
            .bind(patch.driver_arrived_at_origin_at)
            .bind(patch.trip_started_at)
            .bind(patch.driver_arrived_at_destination_at)
            .bind(patch.completed_at)
            .bind(patch.actual_fare.map(|fare| fare.cents()))
            .bind(patch.route_to_origin.as_ref().map(Polyline::as_str))
            .bind(patch.route_to_destination.as_ref().map(Polyline::as_str))
            .bind(self.clock.now())
            .bind(patch.clear_driver)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        if let Some(row) = row {
            return ride_from_row(&row);
        }

        // Nothing matched: report what is there instead
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM ride_requests WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        match current {
            None => Err(RideStoreError::NotFound(id)),
            Some(status) => Err(RideStoreError::Conflict {
                ride_id: id,
                current: parse_status(&status)?,
            }),
        }
    }

    async fn fetch(&self, id: RideId) -> Result<RideRequest, RideStoreError> {
        let query = format!("SELECT {RIDE_COLUMNS} FROM ride_requests WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(RideStoreError::NotFound(id))?;
        ride_from_row(&row)
    }

    async fn active_for(&self, party: Party) -> Result<Option<RideRequest>, RideStoreError> {
        let column = match party {
            Party::Passenger(_) => "passenger_id",
            Party::Driver(_) => "driver_id",
        };
        let terminal: Vec<&str> = RideStatus::ALL
            .into_iter()
            .filter(|status| status.is_terminal())
            .map(RideStatus::as_str)
            .collect();

        let query = format!(
            "SELECT {RIDE_COLUMNS} FROM ride_requests \
             WHERE {column} = $1 AND status <> ALL($2) \
             ORDER BY seq DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(party.as_uuid())
            .bind(&terminal)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(ride_from_row).transpose()
    }

    async fn pending(&self, limit: usize) -> Result<Vec<RideRequest>, RideStoreError> {
        let query = format!(
            "SELECT {RIDE_COLUMNS} FROM ride_requests \
             WHERE status = 'pending' ORDER BY seq ASC LIMIT $1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(ride_from_row).collect()
    }

    async fn listen(&self) -> Result<ChangeStream, RideStoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(db_error)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(db_error)?;

        let notices = stream::unfold(listener, |mut listener| async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        match serde_json::from_str::<RideChange>(notification.payload()) {
                            Ok(change) => return Some((ChangeNotice::Changed(change), listener)),
                            Err(error) => {
                                tracing::warn!(error = %error, "Skipping malformed ride change payload");
                            },
                        }
                    },
                    // Connection dropped; notices sent meanwhile are lost. The
                    // listener reconnects on the next call.
                    Ok(None) => return Some((ChangeNotice::Lagged(0), listener)),
                    Err(error) => {
                        tracing::warn!(error = %error, "Ride change listener failed");
                        return None;
                    },
                }
            }
        });

        Ok(Box::pin(notices))
    }
}

impl std::fmt::Debug for PostgresRideStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRideStore").finish_non_exhaustive()
    }
}

impl RideRequestStore for PostgresRideStore {
    fn create(&self, ride: RideRequest) -> StoreFuture<'_, RideRequest> {
        Box::pin(self.insert(ride))
    }

    fn conditional_update(
        &self,
        id: RideId,
        expected: RidePredicate,
        patch: RidePatch,
    ) -> StoreFuture<'_, RideRequest> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.update(id, &expected, &patch).await;
            let outcome = match &result {
                Ok(_) => UpdateOutcome::Applied,
                Err(RideStoreError::Conflict { .. }) => UpdateOutcome::Conflict,
                Err(RideStoreError::NotFound(_)) => UpdateOutcome::NotFound,
                Err(_) => UpdateOutcome::Error,
            };
            StoreMetrics::record_update(outcome, start.elapsed());
            result
        })
    }

    fn get(&self, id: RideId) -> StoreFuture<'_, RideRequest> {
        Box::pin(self.fetch(id))
    }

    fn find_active_for(&self, party: Party) -> StoreFuture<'_, Option<RideRequest>> {
        Box::pin(self.active_for(party))
    }

    fn list_pending(&self, limit: usize) -> StoreFuture<'_, Vec<RideRequest>> {
        Box::pin(self.pending(limit))
    }
}

impl ChangeFeed for PostgresRideStore {
    fn subscribe(&self) -> StoreFuture<'_, ChangeStream> {
        Box::pin(self.listen())
    }
}

/// Whether `error` is a unique violation on `constraint`.
fn violates_unique(error: &sqlx::Error, constraint: &str) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(UNIQUE_VIOLATION) && db.constraint() == Some(constraint)
        },
        _ => false,
    }
}

fn db_error(error: sqlx::Error) -> RideStoreError {
    match &error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(CHECK_VIOLATION) => {
            RideStoreError::InvalidWrite(db.message().to_string())
        },
        _ => RideStoreError::Database(error.to_string()),
    }
}

fn decode_error(error: sqlx::Error) -> RideStoreError {
    RideStoreError::Serialization(error.to_string())
}

pub(crate) fn parse_status(raw: &str) -> Result<RideStatus, RideStoreError> {
    raw.parse()
        .map_err(|e: ride_dispatch_core::status::UnknownStatus| {
            RideStoreError::Serialization(e.to_string())
        })
}

fn to_db_version(version: u64) -> Result<i64, RideStoreError> {
    i64::try_from(version).map_err(|e| RideStoreError::Serialization(e.to_string()))
}

/// Convert a database row to a `RideRequest`.
fn ride_from_row(row: &PgRow) -> Result<RideRequest, RideStoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let driver_id: Option<Uuid> = row.try_get("driver_id").map_err(decode_error)?;
    let released_driver_id: Option<Uuid> =
        row.try_get("released_driver_id").map_err(decode_error)?;
    let correlation_id: Option<Uuid> = row.try_get("correlation_id").map_err(decode_error)?;
    let actual_fare: Option<i64> = row.try_get("actual_fare_cents").map_err(decode_error)?;
    let route_to_origin: Option<String> = row.try_get("route_to_origin").map_err(decode_error)?;
    let route_to_destination: Option<String> =
        row.try_get("route_to_destination").map_err(decode_error)?;
    let service_category: String = row.try_get("service_category").map_err(decode_error)?;

    Ok(RideRequest {
        id: RideId::from_uuid(row.try_get("id").map_err(decode_error)?),
        created_at: row.try_get("created_at").map_err(decode_error)?,
        passenger_id: PassengerId::from_uuid(row.try_get("passenger_id").map_err(decode_error)?),
        rider_name: row.try_get("rider_name").map_err(decode_error)?,
        rider_phone: row.try_get("rider_phone").map_err(decode_error)?,
        driver_id: driver_id.map(DriverId::from_uuid),
        released_driver_id: released_driver_id.map(DriverId::from_uuid),
        origin: Location {
            lat: row.try_get("origin_lat").map_err(decode_error)?,
            lng: row.try_get("origin_lng").map_err(decode_error)?,
            address: row.try_get("origin_address").map_err(decode_error)?,
        },
        destination: Location {
            lat: row.try_get("destination_lat").map_err(decode_error)?,
            lng: row.try_get("destination_lng").map_err(decode_error)?,
            address: row.try_get("destination_address").map_err(decode_error)?,
        },
        service_category: ServiceCategory::new(service_category),
        estimated_fare: Money::from_cents(
            row.try_get("estimated_fare_cents").map_err(decode_error)?,
        ),
        actual_fare: actual_fare.map(Money::from_cents),
        status: parse_status(&status)?,
        accepted_at: row.try_get("accepted_at").map_err(decode_error)?,
        driver_arrived_at_origin_at: row
            .try_get("driver_arrived_at_origin_at")
            .map_err(decode_error)?,
        trip_started_at: row.try_get("trip_started_at").map_err(decode_error)?,
        driver_arrived_at_destination_at: row
            .try_get("driver_arrived_at_destination_at")
            .map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        version: u64::try_from(version).map_err(|e| RideStoreError::Serialization(e.to_string()))?,
        route_to_origin: route_to_origin.map(Polyline::new),
        route_to_destination: route_to_destination.map(Polyline::new),
        correlation_id: correlation_id.map(CorrelationId::from_uuid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_failure_is_serialization_error() {
        assert!(matches!(
            parse_status("teleported"),
            Err(RideStoreError::Serialization(_))
        ));
        assert_eq!(parse_status("trip_started"), Ok(RideStatus::TripStarted));
    }

    #[test]
    fn columns_cover_every_field() {
        for column in ["version", "route_to_destination", "correlation_id", "completed_at"] {
            assert!(RIDE_COLUMNS.contains(column), "{column}");
        }
    }

    #[test]
    fn versions_beyond_i64_are_rejected() {
        assert!(to_db_version(u64::MAX).is_err());
        assert_eq!(to_db_version(3), Ok(3));
    }
}
