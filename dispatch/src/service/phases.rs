//! Trip phase machine: the driver-driven path from acceptance to completion.

use super::RideService;
use crate::routing::route_or_straight_line;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::ride::{RidePatch, RidePredicate, RideRequest, RouteLeg};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{DriverId, Location, Party, RideId};
use ride_dispatch_runtime::metrics::RideMetrics;

/// Statuses a driver may move a ride into with [`RideService::advance_phase`]
pub const PHASE_TARGETS: [RideStatus; 5] = [
    RideStatus::DriverEnRouteToOrigin,
    RideStatus::DriverAtOrigin,
    RideStatus::TripStarted,
    RideStatus::DriverAtDestination,
    RideStatus::TripCompleted,
];

impl RideService {
    /// Move the driver's ride to `target`.
    ///
    /// Guarded by `driver_id == caller AND status ∈ predecessors(target)`.
    /// Completion freezes `actual_fare` at the estimated fare. Route caching
    /// for the new phase runs afterwards in the background and never undoes
    /// the transition; `position` is the driver's location, needed for the
    /// route to the pickup point.
    ///
    /// # Errors
    ///
    /// - [`RideError::ValidationFailure`]: `target` is not a phase status, or
    ///   the caller is not the assigned driver
    /// - [`RideError::Conflict`]: the ride moved on (cancelled, already advanced)
    /// - [`RideError::NotFound`]: no such ride
    /// - [`RideError::Storage`]: backend failure
    pub async fn advance_phase(
        &self,
        driver_id: DriverId,
        ride_id: RideId,
        target: RideStatus,
        position: Option<Location>,
    ) -> Result<RideRequest, RideError> {
        if !PHASE_TARGETS.contains(&target) {
            return Err(RideError::validation(format!("{target} is not a trip phase")));
        }

        let current = self.env.store.get(ride_id).await?;
        if current.driver_id.is_some_and(|assigned| assigned != driver_id) {
            return Err(RideError::validation("only the assigned driver may advance the trip"));
        }

        let mut patch = RidePatch::advance(target, self.env.clock.now());
        if target == RideStatus::TripCompleted {
            // Flat fare: the quote taken at creation is what the passenger pays
            patch = patch.with_actual_fare(current.estimated_fare);
        }

        let expected = RidePredicate::status_in(RideStatus::predecessors(target)).driver_is(driver_id);
        let ride = match self.env.store.conditional_update(ride_id, expected, patch).await {
            Ok(ride) => ride,
            Err(error) => {
                let error = RideError::from(error);
                if error.is_conflict() {
                    tracing::debug!(
                        ride_id = %ride_id,
                        driver_id = %driver_id,
                        target = %target,
                        error = %error,
                        "Phase advance lost, ride moved on"
                    );
                }
                return Err(error);
            },
        };

        RideMetrics::record_phase(target.as_str());
        tracing::info!(
            ride_id = %ride_id,
            driver_id = %driver_id,
            status = %ride.status,
            "Trip phase advanced"
        );

        match target {
            RideStatus::DriverEnRouteToOrigin if ride.route_to_origin.is_none() => {
                if let Some(position) = position {
                    self.cache_route(&ride, driver_id, RouteLeg::ToOrigin, position);
                }
            },
            RideStatus::TripStarted if ride.route_to_destination.is_none() => {
                self.cache_route(&ride, driver_id, RouteLeg::ToDestination, ride.origin.clone());
            },
            _ => {},
        }

        Ok(ride)
    }

    /// Compute and cache a missing route now, e.g. after recovery reported
    /// one absent.
    ///
    /// `from` is required for [`RouteLeg::ToOrigin`] (the driver's position);
    /// the destination leg starts at the pickup point. A route that is
    /// already cached is returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`RideError::ValidationFailure`]: caller not on the ride, no driver
    ///   assigned yet, or no start point for the pickup leg
    /// - [`RideError::Conflict`]: the ride ended or changed driver meanwhile
    /// - [`RideError::NotFound`]: no such ride
    pub async fn ensure_route(
        &self,
        caller: Party,
        ride_id: RideId,
        leg: RouteLeg,
        from: Option<Location>,
    ) -> Result<RideRequest, RideError> {
        let ride = self.env.store.get(ride_id).await?;
        let on_ride = match caller {
            Party::Passenger(id) => ride.passenger_id == id,
            Party::Driver(id) => ride.driver_id == Some(id),
        };
        if !on_ride {
            return Err(RideError::validation("caller is not part of this ride"));
        }
        let Some(driver_id) = ride.driver_id else {
            return Err(RideError::validation("no driver assigned yet"));
        };

        let cached = match leg {
            RouteLeg::ToOrigin => ride.route_to_origin.is_some(),
            RouteLeg::ToDestination => ride.route_to_destination.is_some(),
        };
        if cached {
            return Ok(ride);
        }

        let from = match leg {
            RouteLeg::ToOrigin => {
                from.ok_or_else(|| RideError::validation("route to pickup needs the driver position"))?
            },
            RouteLeg::ToDestination => ride.origin.clone(),
        };
        self.write_route(&ride, driver_id, leg, from).await
    }

    fn cache_route(&self, ride: &RideRequest, driver_id: DriverId, leg: RouteLeg, from: Location) {
        let service = self.clone();
        let ride = ride.clone();
        self.tasks.spawn(async move {
            if let Err(error) = service.write_route(&ride, driver_id, leg, from).await {
                tracing::debug!(ride_id = %ride.id, ?leg, error = %error, "Route not cached");
            }
        });
    }

    async fn write_route(
        &self,
        ride: &RideRequest,
        driver_id: DriverId,
        leg: RouteLeg,
        from: Location,
    ) -> Result<RideRequest, RideError> {
        let to = match leg {
            RouteLeg::ToOrigin => &ride.origin,
            RouteLeg::ToDestination => &ride.destination,
        };
        let (polyline, fallback) =
            route_or_straight_line(self.env.routing.as_ref(), &self.env.routing_retry, &from, to)
                .await;

        let updated = self
            .env
            .store
            .conditional_update(
                ride.id,
                RidePredicate::any_open().driver_is(driver_id),
                RidePatch::route(leg, polyline),
            )
            .await?;

        tracing::debug!(ride_id = %ride.id, ?leg, fallback, "Route cached");
        Ok(updated)
    }
}
