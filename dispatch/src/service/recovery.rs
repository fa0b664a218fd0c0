//! Active trip recovery after a restart or reconnect.

use super::RideService;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::phase::ActiveTripView;
use ride_dispatch_core::types::{DriverId, Party, PassengerId};

impl RideService {
    /// The passenger's live ride, if any, with its derived phase.
    ///
    /// Reads only. Calling it any number of times changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RideError::Storage`] on backend failure.
    pub async fn recover_for_passenger(
        &self,
        passenger_id: PassengerId,
    ) -> Result<Option<ActiveTripView>, RideError> {
        let ride = self.env.store.find_active_for(Party::Passenger(passenger_id)).await?;
        let view = ride.as_ref().map(ActiveTripView::for_passenger);
        log_recovery(Party::Passenger(passenger_id), view.as_ref());
        Ok(view)
    }

    /// The driver's live ride, if any, with its derived phase.
    ///
    /// # Errors
    ///
    /// Returns [`RideError::Storage`] on backend failure.
    pub async fn recover_for_driver(&self, driver_id: DriverId) -> Result<Option<ActiveTripView>, RideError> {
        let ride = self.env.store.find_active_for(Party::Driver(driver_id)).await?;
        let view = ride.as_ref().map(ActiveTripView::for_driver);
        log_recovery(Party::Driver(driver_id), view.as_ref());
        Ok(view)
    }
}

fn log_recovery(party: Party, view: Option<&ActiveTripView>) {
    match view {
        Some(view) => tracing::info!(
            party = %party,
            ride_id = %view.ride_id,
            status = %view.status,
            missing_route = ?view.missing_route,
            "Active trip recovered"
        ),
        None => tracing::debug!(party = %party, "No active trip to recover"),
    }
}
