//! Client sessions as reducers.
//!
//! A session holds only what one client shows: open offers, the trip view,
//! an optimistic request. Every command becomes an effect calling
//! [`RideService`]; the outcome comes back as an action. Live changes reach
//! a session through [`forward_changes`], which feeds observer snapshots in
//! as actions, and are folded in with the same phase derivation recovery
//! uses, so a session never disagrees with a fresh recovery.

pub mod driver;
pub mod passenger;

pub use driver::{DriverAction, DriverCommand, DriverSession, DriverSessionReducer};
pub use passenger::{PassengerAction, PassengerSession, PassengerSessionReducer};

use crate::observer::RideObserver;
use crate::service::RideService;
use futures::StreamExt;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::phase::ActiveTripView;
use ride_dispatch_core::reducer::Reducer;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::RideId;
use ride_dispatch_runtime::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What a session environment carries.
#[derive(Clone)]
pub struct SessionEnvironment {
    /// Ride operations
    pub service: RideService,
    /// Local time
    pub clock: Arc<dyn Clock>,
    /// How long an offer stays on screen
    pub popup_timeout: Duration,
}

impl SessionEnvironment {
    /// Environment sharing `service`'s clock and popup window
    #[must_use]
    pub fn new(service: RideService) -> Self {
        let clock = Arc::clone(&service.env().clock);
        let popup_timeout = service.env().timers.driver_popup_timeout;
        Self {
            service,
            clock,
            popup_timeout,
        }
    }
}

impl std::fmt::Debug for SessionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEnvironment")
            .field("service", &self.service)
            .field("popup_timeout", &self.popup_timeout)
            .finish_non_exhaustive()
    }
}

/// A message for the person holding the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// Another driver won the ride
    AlreadyTaken(RideId),
    /// The ride changed under a command; the session reset to idle
    RideMovedOn(RideId),
    /// The ride reached a terminal status
    RideEnded {
        /// The ride
        ride_id: RideId,
        /// How it ended
        status: RideStatus,
    },
    /// The command was refused
    Rejected(String),
}

/// Replace `current` with a view of `ride` unless it already shows that
/// ride at the same or a newer version.
///
/// Returns whether the view changed.
pub(crate) fn fold_view(
    current: &mut Option<ActiveTripView>,
    ride: &RideRequest,
    view: impl FnOnce(&RideRequest) -> ActiveTripView,
) -> bool {
    if current
        .as_ref()
        .is_some_and(|shown| shown.ride_id == ride.id && shown.version >= ride.version)
    {
        return false;
    }
    *current = Some(view(ride));
    true
}

/// Feed every snapshot of `ride_id` into `store` as an action.
///
/// Ends when the watch ends (terminal snapshot) or the store shuts down.
pub fn forward_changes<S, A, E, R, F>(
    store: Arc<Store<S, A, E, R>>,
    observer: &RideObserver,
    ride_id: RideId,
    to_action: F,
) -> JoinHandle<()>
where
    R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
    A: Send + Clone + 'static,
    S: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(RideRequest) -> A + Send + 'static,
{
    let mut snapshots = observer.watch(ride_id);
    tokio::spawn(async move {
        while let Some(ride) = snapshots.next().await {
            if let Err(error) = store.send(to_action(ride)).await {
                tracing::debug!(ride_id = %ride_id, error = %error, "Session closed, no longer forwarding");
                return;
            }
        }
        tracing::debug!(ride_id = %ride_id, "Ride watch ended");
    })
}
