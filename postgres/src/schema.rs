//! Table definitions and the change notification trigger.

use ride_dispatch_core::store::RideStoreError;
use sqlx::PgPool;

/// Channel the trigger publishes ride changes on
pub const CHANGE_CHANNEL: &str = "ride_changes";

/// Partial unique index that keeps one non-terminal ride per passenger
pub(crate) const ONE_LIVE_RIDE_INDEX: &str = "idx_ride_requests_one_live_per_passenger";

/// Statements applied by [`migrate`], in order. All are idempotent.
const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS ride_requests (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        passenger_id UUID NOT NULL,
        rider_name TEXT,
        rider_phone TEXT,
        driver_id UUID,
        released_driver_id UUID,
        origin_lat DOUBLE PRECISION NOT NULL,
        origin_lng DOUBLE PRECISION NOT NULL,
        origin_address TEXT NOT NULL,
        destination_lat DOUBLE PRECISION NOT NULL,
        destination_lng DOUBLE PRECISION NOT NULL,
        destination_address TEXT NOT NULL,
        service_category TEXT NOT NULL,
        estimated_fare_cents BIGINT NOT NULL,
        actual_fare_cents BIGINT,
        status TEXT NOT NULL,
        accepted_at TIMESTAMPTZ,
        driver_arrived_at_origin_at TIMESTAMPTZ,
        trip_started_at TIMESTAMPTZ,
        driver_arrived_at_destination_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL,
        version BIGINT NOT NULL,
        route_to_origin TEXT,
        route_to_destination TEXT,
        correlation_id UUID,
        CONSTRAINT ride_driver_required CHECK (
            status NOT IN ('accepted', 'driver_en_route_to_origin', 'driver_at_origin',
                           'trip_started', 'driver_at_destination', 'trip_completed')
            OR driver_id IS NOT NULL
        ),
        CONSTRAINT ride_driver_forbidden CHECK (
            status IN ('accepted', 'driver_en_route_to_origin', 'driver_at_origin',
                       'trip_started', 'driver_at_destination', 'trip_completed')
            OR driver_id IS NULL
        ),
        CONSTRAINT ride_released_driver_terminal CHECK (
            released_driver_id IS NULL
            OR status IN ('cancelled_by_passenger', 'cancelled_by_driver', 'timed_out_passenger')
        ),
        CONSTRAINT ride_completed_has_fare CHECK (
            status <> 'trip_completed' OR actual_fare_cents IS NOT NULL
        )
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_ride_requests_passenger ON ride_requests (passenger_id, seq DESC)",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_ride_requests_one_live_per_passenger
        ON ride_requests (passenger_id)
        WHERE status IN ('pending', 'accepted', 'driver_en_route_to_origin', 'driver_at_origin',
                         'trip_started', 'driver_at_destination')
    ",
    "CREATE INDEX IF NOT EXISTS idx_ride_requests_driver ON ride_requests (driver_id, seq DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ride_requests_pending ON ride_requests (seq) WHERE status = 'pending'",
    r"
    CREATE TABLE IF NOT EXISTS ride_cancellations (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        ride_id UUID NOT NULL,
        canceller_id UUID NOT NULL,
        canceller_role TEXT NOT NULL,
        reason TEXT NOT NULL,
        free_text TEXT,
        status_at_cancel TEXT NOT NULL,
        driver_at_cancel UUID,
        applied BOOLEAN NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT ride_cancellations_one_per_canceller UNIQUE (ride_id, canceller_id)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_ride_cancellations_ride ON ride_cancellations (ride_id, seq)",
    r"
    CREATE OR REPLACE FUNCTION notify_ride_change() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify(
            'ride_changes',
            json_build_object('ride_id', NEW.id, 'status', NEW.status, 'version', NEW.version)::text
        );
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    ",
    "DROP TRIGGER IF EXISTS ride_requests_notify ON ride_requests",
    r"
    CREATE TRIGGER ride_requests_notify
        AFTER INSERT OR UPDATE ON ride_requests
        FOR EACH ROW EXECUTE FUNCTION notify_ride_change()
    ",
];

/// Create the tables, indexes and trigger if they do not exist.
///
/// # Errors
///
/// Returns [`RideStoreError::Database`] if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), RideStoreError> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| RideStoreError::Database(e.to_string()))?;
    }
    tracing::info!(statements = MIGRATIONS.len(), "Ride dispatch schema migrated");
    Ok(())
}
