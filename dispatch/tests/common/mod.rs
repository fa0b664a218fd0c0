//! Shared wiring for the dispatch integration tests.

#![allow(dead_code, clippy::expect_used)] // each test binary uses a different subset

use ride_dispatch::config::TimerConfig;
use ride_dispatch::{DispatchEnvironment, RideService};
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::types::{DriverId, PassengerId};
use ride_dispatch_runtime::retry::RetryPolicy;
use ride_dispatch_testing::{
    InMemoryCancellationLog, InMemoryRideStore, ManualClock, RecordingNotifier,
    StaticDriverDirectory, fixtures, manual_clock,
};
use std::sync::Arc;
use std::time::Duration;

/// Passenger wait window used by every harness
pub const PASSENGER_TIMEOUT: Duration = Duration::from_secs(60);
/// Passenger no-show window used by every harness
pub const NO_SHOW: Duration = Duration::from_secs(300);

/// A ride service over in-memory backends with handles to inspect them.
pub struct Harness {
    pub store: Arc<InMemoryRideStore>,
    pub log: Arc<InMemoryCancellationLog>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: ManualClock,
    pub drivers: Vec<DriverId>,
    pub service: RideService,
}

impl Harness {
    /// `online` verified drivers, all reachable
    pub fn new(online: usize) -> Self {
        let clock = manual_clock();
        let store = Arc::new(InMemoryRideStore::with_clock(Arc::new(clock.clone())));
        Self::over(store, clock, online)
    }

    /// A second service instance over an existing store, e.g. after a restart
    pub fn over(store: Arc<InMemoryRideStore>, clock: ManualClock, online: usize) -> Self {
        let log = Arc::new(InMemoryCancellationLog::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let drivers: Vec<DriverId> = (0..online).map(|_| DriverId::new()).collect();

        let env = DispatchEnvironment::new(Arc::clone(&store), log.clone())
            .with_drivers(Arc::new(StaticDriverDirectory::online(&drivers)))
            .with_notifier(notifier.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_timers(TimerConfig {
                passenger_timeout: PASSENGER_TIMEOUT,
                driver_popup_timeout: Duration::from_secs(15),
                passenger_no_show: NO_SHOW,
            })
            .with_routing_retry(
                RetryPolicy::builder()
                    .max_retries(1)
                    .initial_delay(Duration::from_millis(1))
                    .build(),
            );

        Self {
            store,
            log,
            notifier,
            clock,
            drivers,
            service: RideService::new(env),
        }
    }

    /// Replace the service's environment, keeping the in-memory handles
    pub fn with_env(mut self, change: impl FnOnce(DispatchEnvironment) -> DispatchEnvironment) -> Self {
        self.service = RideService::new(change(self.service.env().clone()));
        self
    }

    /// Create a ride for a fresh passenger
    pub async fn request(&self) -> RideRequest {
        self.request_for(PassengerId::new()).await
    }

    /// Create a ride for `passenger_id`
    pub async fn request_for(&self, passenger_id: PassengerId) -> RideRequest {
        self.service
            .create(fixtures::payload(passenger_id))
            .await
            .expect("ride should be created")
    }

    /// Create a ride and let the first online driver win it
    pub async fn accepted(&self) -> (RideRequest, DriverId) {
        let ride = self.request().await;
        let driver = self.drivers[0];
        let ride = self
            .service
            .accept(driver, ride.id)
            .await
            .expect("first accept should win");
        (ride, driver)
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).expect("duration in range"));
    }
}
