//! Passenger wait timeout and passenger no-show.
//!
//! Timers own no state. When one fires it attempts the same conditional
//! write anyone could; if the ride already moved on the write conflicts and
//! the timer simply ends.

use super::RideService;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::ride::{RidePatch, RidePredicate, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{DriverId, RideId};
use ride_dispatch_runtime::metrics::RideMetrics;
use std::time::Duration;

/// Upper bound on rides re-armed by one [`RideService::rearm_pending`] call
const REARM_BATCH: usize = 1_000;

impl RideService {
    /// Arm the passenger wait timer of a freshly created ride.
    ///
    /// The window is measured from `created_at`, so re-arming after a restart
    /// only waits for what is left of it.
    pub(super) fn arm_passenger_timeout(&self, ride: &RideRequest) {
        let elapsed = (self.env.clock.now() - ride.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = self.env.timers.passenger_timeout.saturating_sub(elapsed);
        let service = self.clone();
        let ride_id = ride.id;

        self.timers.arm(ride_id, async move {
            tokio::time::sleep(remaining).await;
            tracing::debug!(ride_id = %ride_id, "Passenger wait timer fired");
            if let Err(error) = service.expire_pending(ride_id).await {
                tracing::warn!(ride_id = %ride_id, error = %error, "Passenger timeout write failed");
            }
        });
    }

    /// End a ride nobody accepted with `no_drivers_available`.
    ///
    /// Idempotent: returns `Ok(None)` when the ride is no longer `pending`
    /// (accepted, cancelled, already expired) or does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RideError::Storage`] on backend failure.
    pub async fn expire_pending(&self, ride_id: RideId) -> Result<Option<RideRequest>, RideError> {
        let result = self
            .env
            .store
            .conditional_update(
                ride_id,
                RidePredicate::status_is(RideStatus::Pending).driver_unassigned(),
                RidePatch::status(RideStatus::NoDriversAvailable),
            )
            .await
            .map_err(RideError::from);

        match result {
            Ok(ride) => {
                RideMetrics::record_timeout("passenger_wait");
                tracing::info!(ride_id = %ride_id, status = %ride.status, "No driver accepted in time");
                Ok(Some(ride))
            },
            Err(error) if error.is_conflict() => {
                tracing::debug!(ride_id = %ride_id, error = %error, "Passenger timeout lost, ride moved on");
                Ok(None)
            },
            Err(error) => Err(error),
        }
    }

    /// Re-arm wait timers for rides left `pending`, e.g. after a restart.
    ///
    /// Rides already past their window expire at once. Returns how many
    /// timers were armed.
    ///
    /// # Errors
    ///
    /// Returns [`RideError::Storage`] if the pending rides cannot be listed.
    pub async fn rearm_pending(&self) -> Result<usize, RideError> {
        let pending = self.env.store.list_pending(REARM_BATCH).await?;
        for ride in &pending {
            self.arm_passenger_timeout(ride);
        }
        tracing::info!(rides = pending.len(), "Passenger wait timers re-armed");
        Ok(pending.len())
    }

    /// Driver ends the ride because the passenger never showed up.
    ///
    /// Allowed once the driver has waited at the pickup point for the no-show
    /// window. Guarded by `driver_id == caller AND status == driver_at_origin`.
    /// The driver is released in the same write.
    ///
    /// # Errors
    ///
    /// - [`RideError::ValidationFailure`]: wrong driver, or the window has not
    ///   elapsed yet
    /// - [`RideError::Conflict`]: the ride is not waiting at the pickup point
    /// - [`RideError::NotFound`]: no such ride
    pub async fn end_no_show(&self, driver_id: DriverId, ride_id: RideId) -> Result<RideRequest, RideError> {
        let ride = self.env.store.get(ride_id).await?;
        if ride.driver_id != Some(driver_id) {
            return Err(RideError::validation("only the assigned driver may report a no-show"));
        }
        if ride.status != RideStatus::DriverAtOrigin {
            return Err(RideError::Conflict {
                ride_id,
                current: ride.status,
            });
        }

        let Some(arrived_at) = ride.driver_arrived_at_origin_at else {
            return Err(RideError::validation("driver has not reported arrival"));
        };
        let waited = (self.env.clock.now() - arrived_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if waited < self.env.timers.passenger_no_show {
            return Err(RideError::validation(format!(
                "no-show allowed after {}s at pickup (waited {}s)",
                self.env.timers.passenger_no_show.as_secs(),
                waited.as_secs()
            )));
        }

        let ride = self
            .env
            .store
            .conditional_update(
                ride_id,
                RidePredicate::status_is(RideStatus::DriverAtOrigin).driver_is(driver_id),
                RidePatch::release(RideStatus::TimedOutPassenger),
            )
            .await?;

        RideMetrics::record_timeout("passenger_no_show");
        tracing::info!(ride_id = %ride_id, driver_id = %driver_id, status = %ride.status, "Passenger no-show");
        Ok(ride)
    }
}
