//! The acceptance race.

use super::RideService;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::ride::{RidePatch, RidePredicate, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{DriverId, RideId};
use ride_dispatch_runtime::metrics::RideMetrics;

impl RideService {
    /// Claim a pending ride for `driver_id`.
    ///
    /// The write is guarded by `status == pending AND driver_id IS NULL`, so
    /// of any number of concurrent callers exactly one succeeds. Losing is
    /// normal and reported as [`RideError::Conflict`] ("already taken").
    ///
    /// # Errors
    ///
    /// - [`RideError::Conflict`]: another driver won, or the ride left `pending`
    /// - [`RideError::NotFound`]: no such ride
    /// - [`RideError::ValidationFailure`]: the driver is the ride's passenger
    /// - [`RideError::Storage`]: backend failure
    pub async fn accept(&self, driver_id: DriverId, ride_id: RideId) -> Result<RideRequest, RideError> {
        let ride = self.env.store.get(ride_id).await?;
        if ride.passenger_id.as_uuid() == driver_id.as_uuid() {
            return Err(RideError::validation("a passenger cannot accept their own ride"));
        }

        let result = self
            .env
            .store
            .conditional_update(
                ride_id,
                RidePredicate::status_is(RideStatus::Pending).driver_unassigned(),
                RidePatch::accept(driver_id, self.env.clock.now()),
            )
            .await
            .map_err(RideError::from);

        match result {
            Ok(ride) => {
                RideMetrics::record_accept(true);
                self.timers.disarm(ride_id);
                tracing::info!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    status = %ride.status,
                    "Ride accepted"
                );
                Ok(ride)
            },
            Err(error) if error.is_conflict() => {
                RideMetrics::record_accept(false);
                tracing::debug!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    error = %error,
                    "Acceptance lost, ride already taken"
                );
                Err(error)
            },
            Err(error) => Err(error),
        }
    }
}
