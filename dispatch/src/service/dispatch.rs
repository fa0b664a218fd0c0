//! Offer fan-out to eligible drivers.

use super::RideService;
use futures::future::join_all;
use ride_dispatch_core::collaborators::{DriverProfile, RideOffer};
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::types::DriverId;
use ride_dispatch_runtime::metrics::DispatchMetrics;

impl RideService {
    pub(super) fn start_fan_out(&self, ride: &RideRequest) {
        let service = self.clone();
        let ride = ride.clone();
        self.tasks.spawn(async move {
            let notified = service.fan_out(&ride).await;
            tracing::debug!(ride_id = %ride.id, notified, "Fan-out finished");
        });
    }

    /// Offer `ride` to every online, verified driver.
    ///
    /// Delivery failures are logged and counted, never returned. Returns the
    /// number of offers the transport accepted.
    pub async fn fan_out(&self, ride: &RideRequest) -> usize {
        let profiles = match self.env.drivers.drivers().await {
            Ok(profiles) => profiles,
            Err(error) => {
                tracing::warn!(ride_id = %ride.id, error = %error, "Driver directory unavailable, no offers sent");
                return 0;
            },
        };

        let recipients = eligible_drivers(&profiles, ride);
        DispatchMetrics::record_fanout(recipients.len());
        if recipients.is_empty() {
            tracing::info!(ride_id = %ride.id, "No eligible drivers online");
            return 0;
        }

        let offer = offer_for(ride);
        let deliveries = recipients.iter().map(|&driver_id| {
            let offer = offer.clone();
            async move {
                match self.env.notifier.notify(driver_id, offer).await {
                    Ok(()) => {
                        DispatchMetrics::record_notification(true);
                        true
                    },
                    Err(error) => {
                        DispatchMetrics::record_notification(false);
                        tracing::warn!(
                            ride_id = %ride.id,
                            driver_id = %driver_id,
                            error = %error,
                            "Offer delivery failed"
                        );
                        false
                    },
                }
            }
        });

        let sent = join_all(deliveries).await.into_iter().filter(|sent| *sent).count();
        tracing::info!(ride_id = %ride.id, drivers = recipients.len(), sent, "Ride offered");
        sent
    }
}

/// Online and verified, minus the ride's own passenger.
fn eligible_drivers(profiles: &[DriverProfile], ride: &RideRequest) -> Vec<DriverId> {
    let mut drivers: Vec<DriverId> = profiles
        .iter()
        .filter(|profile| profile.is_eligible())
        .map(|profile| profile.driver_id)
        .filter(|driver_id| driver_id.as_uuid() != ride.passenger_id.as_uuid())
        .collect();
    drivers.sort_unstable();
    drivers.dedup();
    drivers
}

/// The payload a driver sees in the popup
#[must_use]
pub fn offer_for(ride: &RideRequest) -> RideOffer {
    RideOffer {
        ride_id: ride.id,
        origin: ride.origin.clone(),
        destination: ride.destination.clone(),
        service_category: ride.service_category.clone(),
        estimated_fare: ride.estimated_fare,
        created_at: ride.created_at,
    }
}
