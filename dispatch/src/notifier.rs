//! Push transport that only logs.
//!
//! Stands in for the real device push service in local runs: every offer is
//! written as a structured `tracing` event and counted as delivered.

use ride_dispatch_core::collaborators::{NotifyError, PushNotifier, RideOffer};
use ride_dispatch_core::types::DriverId;
use std::future::Future;
use std::pin::Pin;

/// Logs each offer at `info` and reports success.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl PushNotifier for TracingNotifier {
    fn notify(
        &self,
        driver_id: DriverId,
        offer: RideOffer,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                driver_id = %driver_id,
                ride_id = %offer.ride_id,
                category = offer.service_category.as_str(),
                fare = %offer.estimated_fare,
                pickup = %offer.origin.address,
                "Ride offer pushed"
            );
            Ok(())
        })
    }
}
