//! Ride creation and retry after nobody accepted.

use super::RideService;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::ride::{NewRideRequest, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{CorrelationId, PassengerId, RideId};
use ride_dispatch_runtime::metrics::RideMetrics;

impl RideService {
    /// Create a `pending` ride, fan it out and start the passenger wait timer.
    ///
    /// The estimated fare comes from the payload or, when absent, from the
    /// fare policy. Returns as soon as the record is stored; drivers are
    /// notified in the background. The store rejects the insert when the
    /// passenger already has a live ride, atomically with the write.
    ///
    /// # Errors
    ///
    /// - [`RideError::ValidationFailure`]: bad payload, no fare available, or
    ///   the passenger already has a live ride
    /// - [`RideError::Storage`]: the store rejected the insert
    pub async fn create(&self, payload: NewRideRequest) -> Result<RideRequest, RideError> {
        payload.validate().map_err(RideError::ValidationFailure)?;

        let fare = match payload.estimated_fare {
            Some(fare) => fare,
            None => self
                .env
                .fares
                .estimate(&payload.service_category, &payload.origin, &payload.destination)
                .ok_or_else(|| {
                    RideError::validation(format!(
                        "no fare available for category {}",
                        payload.service_category
                    ))
                })?,
        };

        let ride = RideRequest::new_pending(RideId::new(), payload, fare, self.env.clock.now());
        let ride = self.env.store.create(ride).await?;

        RideMetrics::record_created(ride.service_category.as_str());
        tracing::info!(
            ride_id = %ride.id,
            passenger_id = %ride.passenger_id,
            status = %ride.status,
            fare = %ride.estimated_fare,
            "Ride requested"
        );

        self.start_fan_out(&ride);
        self.arm_passenger_timeout(&ride);
        Ok(ride)
    }

    /// Request again with the payload of a ride that found no driver.
    ///
    /// `correlation_id` tags the new record for optimistic clients.
    ///
    /// # Errors
    ///
    /// - [`RideError::NotFound`]: no such ride
    /// - [`RideError::ValidationFailure`]: not the caller's ride, or it did
    ///   not end in `no_drivers_available`
    /// - anything [`RideService::create`] returns
    pub async fn retry(
        &self,
        passenger_id: PassengerId,
        ride_id: RideId,
        correlation_id: Option<CorrelationId>,
    ) -> Result<RideRequest, RideError> {
        let previous = self.env.store.get(ride_id).await?;
        if previous.passenger_id != passenger_id {
            return Err(RideError::validation("only the requesting passenger may retry"));
        }
        if previous.status != RideStatus::NoDriversAvailable {
            return Err(RideError::validation(format!(
                "retry needs a ride that found no driver (ride is {})",
                previous.status
            )));
        }

        let mut payload = previous.to_payload();
        payload.correlation_id = correlation_id;
        tracing::info!(ride_id = %ride_id, "Retrying ride request");
        self.create(payload).await
    }
}
