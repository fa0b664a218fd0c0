//! Injected dependencies of the ride services.

use crate::config::{Config, RoutingConfig, TimerConfig};
use crate::fare::DistanceFarePolicy;
use crate::notifier::TracingNotifier;
use crate::routing::{OsrmRoutingProvider, StraightLineRouting};
use ride_dispatch_core::cancellation::CancellationLog;
use ride_dispatch_core::collaborators::{
    DriverDirectory, FarePolicy, PushNotifier, RoutingProvider,
};
use ride_dispatch_core::environment::{Clock, SystemClock};
use ride_dispatch_core::store::{ChangeFeed, RideRequestStore};
use ride_dispatch_runtime::retry::RetryPolicy;
use ride_dispatch_testing::StaticDriverDirectory;
use std::sync::Arc;

/// Everything the ride services touch outside their own memory.
///
/// Cloning is cheap; every collaborator is behind an `Arc`.
#[derive(Clone)]
pub struct DispatchEnvironment {
    /// The single source of truth
    pub store: Arc<dyn RideRequestStore>,
    /// Push notifications of ride changes
    pub changes: Arc<dyn ChangeFeed>,
    /// Append-only cancellation record
    pub cancellations: Arc<dyn CancellationLog>,
    /// Online/verified driver listing
    pub drivers: Arc<dyn DriverDirectory>,
    /// Offer delivery
    pub notifier: Arc<dyn PushNotifier>,
    /// Route geometry
    pub routing: Arc<dyn RoutingProvider>,
    /// Quotes at creation
    pub fares: Arc<dyn FarePolicy>,
    /// Time source for lifecycle timestamps and windows
    pub clock: Arc<dyn Clock>,
    /// Abandonment windows
    pub timers: TimerConfig,
    /// Retry policy for routing calls
    pub routing_retry: RetryPolicy,
}

impl DispatchEnvironment {
    /// Environment over `store`, with local defaults for every collaborator.
    ///
    /// Defaults: no drivers, logging push transport, straight-line routing,
    /// distance fares from [`Config::default`], the system clock and default
    /// windows. Override with the `with_*` methods.
    pub fn new<S>(store: Arc<S>, cancellations: Arc<dyn CancellationLog>) -> Self
    where
        S: RideRequestStore + ChangeFeed + 'static,
    {
        let config = Config::default();
        Self {
            store: store.clone(),
            changes: store,
            cancellations,
            drivers: Arc::new(StaticDriverDirectory::default()),
            notifier: Arc::new(TracingNotifier),
            routing: Arc::new(StraightLineRouting),
            fares: Arc::new(DistanceFarePolicy::from_config(&config.fare)),
            clock: Arc::new(SystemClock),
            timers: config.timers,
            routing_retry: routing_retry(&config.routing),
        }
    }

    /// Apply the timer, routing and fare sections of `config`
    #[must_use]
    pub fn configured(mut self, config: &Config) -> Self {
        self.timers = config.timers;
        self.routing_retry = routing_retry(&config.routing);
        self.fares = Arc::new(DistanceFarePolicy::from_config(&config.fare));
        self.routing = match &config.routing.osrm_url {
            Some(url) => Arc::new(OsrmRoutingProvider::new(url.clone(), config.routing.timeout)),
            None => Arc::new(StraightLineRouting),
        };
        self
    }

    /// Use `drivers` as the directory
    #[must_use]
    pub fn with_drivers(mut self, drivers: Arc<dyn DriverDirectory>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Use `notifier` for offers
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn PushNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use `routing` for route geometry
    #[must_use]
    pub fn with_routing(mut self, routing: Arc<dyn RoutingProvider>) -> Self {
        self.routing = routing;
        self
    }

    /// Use `fares` for creation quotes
    #[must_use]
    pub fn with_fares(mut self, fares: Arc<dyn FarePolicy>) -> Self {
        self.fares = fares;
        self
    }

    /// Use `clock` for timestamps and windows
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `timers` for the abandonment windows
    #[must_use]
    pub const fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Use `policy` when retrying routing calls
    #[must_use]
    pub fn with_routing_retry(mut self, policy: RetryPolicy) -> Self {
        self.routing_retry = policy;
        self
    }
}

impl std::fmt::Debug for DispatchEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEnvironment")
            .field("timers", &self.timers)
            .field("routing_retry", &self.routing_retry)
            .finish_non_exhaustive()
    }
}

fn routing_retry(config: &RoutingConfig) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(config.max_retries)
        .initial_delay(config.initial_backoff)
        .build()
}
