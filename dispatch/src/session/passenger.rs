//! Passenger client session: optimistic request, live trip view,
//! cancellation and retry.

use super::{Notice, SessionEnvironment, fold_view};
use crate::optimistic::{OptimisticList, Reconciled};
use crate::service::CancelRequest;
use ride_dispatch_core::async_effect;
use ride_dispatch_core::cancellation::{CancellationReason, CancellationRecord};
use ride_dispatch_core::effect::Effect;
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::phase::ActiveTripView;
use ride_dispatch_core::reducer::Reducer;
use ride_dispatch_core::ride::{NewRideRequest, RideRequest};
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{CorrelationId, Money, Party, PassengerId, RideId};
use smallvec::{SmallVec, smallvec};

/// What one passenger's client shows.
#[derive(Clone, Debug, PartialEq)]
pub struct PassengerSession {
    /// The signed-in passenger
    pub passenger_id: PassengerId,
    /// Requests made from this client, optimistic until stored
    pub requests: OptimisticList<RideRequest>,
    /// The current (or just finished) ride
    pub active: Option<ActiveTripView>,
    /// Last message for the passenger
    pub notice: Option<Notice>,
}

impl PassengerSession {
    /// Idle session for `passenger_id`
    #[must_use]
    pub fn new(passenger_id: PassengerId) -> Self {
        Self {
            passenger_id,
            requests: OptimisticList::new(),
            active: None,
            notice: None,
        }
    }

    /// Whether a request is in flight or a ride is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.requests.has_pending() || self.active.as_ref().is_some_and(|view| !view.phase.is_final())
    }

    /// Id of the ride on screen
    #[must_use]
    pub fn current_ride(&self) -> Option<RideId> {
        self.active.as_ref().map(|view| view.ride_id)
    }
}

/// Passenger session actions.
#[derive(Clone, Debug)]
pub enum PassengerAction {
    // Commands
    /// Ask for a ride
    RequestRide {
        /// What to request
        payload: NewRideRequest,
    },
    /// Cancel the ride on screen
    Cancel {
        /// Reason code
        reason: CancellationReason,
        /// Free text, required for `other`
        free_text: Option<String>,
    },
    /// Request again after nobody accepted
    Retry,
    /// Reload the live ride from the store
    Recover,

    // Effect results
    /// The store accepted a request
    RideCreated {
        /// The ride as stored
        ride: RideRequest,
    },
    /// The store refused a request
    RequestFailed {
        /// Correlation id of the optimistic copy
        correlation_id: CorrelationId,
        /// Why
        error: RideError,
    },
    /// A fresh snapshot of the passenger's ride
    RideChanged {
        /// The ride as stored
        ride: RideRequest,
    },
    /// The cancellation was logged
    Cancelled {
        /// The log entry
        record: CancellationRecord,
    },
    /// Recovery finished
    Recovered {
        /// The passenger's live ride, if any
        view: Option<ActiveTripView>,
    },
    /// A cancel command failed
    CommandFailed {
        /// The ride it targeted
        ride_id: RideId,
        /// Why
        error: RideError,
    },
}

/// Reducer for [`PassengerSession`].
#[derive(Clone, Debug, Default)]
pub struct PassengerSessionReducer;

impl PassengerSessionReducer {
    /// Create the reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Reducer for PassengerSessionReducer {
    type State = PassengerSession;
    type Action = PassengerAction;
    type Environment = SessionEnvironment;

    #[allow(clippy::too_many_lines)] // one arm per action
    fn reduce(
        &self,
        state: &mut PassengerSession,
        action: PassengerAction,
        env: &SessionEnvironment,
    ) -> SmallVec<[Effect<PassengerAction>; 4]> {
        match action {
            PassengerAction::RequestRide { mut payload } => {
                if state.is_busy() {
                    state.notice = Some(Notice::Rejected("a ride is already in progress".to_string()));
                    return smallvec![Effect::None];
                }
                payload.passenger_id = state.passenger_id;
                let correlation_id = CorrelationId::new();
                payload.correlation_id = Some(correlation_id);
                state.requests.push_pending(correlation_id, provisional(&payload, env));
                state.notice = None;

                let service = env.service.clone();
                smallvec![async_effect! {
                    match service.create(payload).await {
                        Ok(ride) => Some(PassengerAction::RideCreated { ride }),
                        Err(error) => Some(PassengerAction::RequestFailed { correlation_id, error }),
                    }
                }]
            },

            PassengerAction::Retry => {
                let Some(view) = state.active.as_ref() else {
                    state.notice = Some(Notice::Rejected("nothing to retry".to_string()));
                    return smallvec![Effect::None];
                };
                if view.status != RideStatus::NoDriversAvailable || state.requests.has_pending() {
                    state.notice = Some(Notice::Rejected("only a ride nobody accepted can be retried".to_string()));
                    return smallvec![Effect::None];
                }
                let ride_id = view.ride_id;
                let Some(previous) = state
                    .requests
                    .iter()
                    .map(|item| item.value())
                    .find(|ride| ride.id == ride_id)
                    .cloned()
                else {
                    // Recovered from another device: let the service rebuild the payload
                    return retry_effect(state, env, ride_id, CorrelationId::new());
                };

                let correlation_id = CorrelationId::new();
                let mut payload = previous.to_payload();
                payload.correlation_id = Some(correlation_id);
                state.requests.push_pending(correlation_id, provisional(&payload, env));
                retry_effect(state, env, ride_id, correlation_id)
            },

            PassengerAction::RideCreated { ride } | PassengerAction::RideChanged { ride } => {
                if ride.passenger_id != state.passenger_id {
                    return smallvec![Effect::None];
                }
                let reconciled = state.requests.reconcile(ride.clone());
                if reconciled == Reconciled::Ignored {
                    return smallvec![Effect::None];
                }
                let was_live = state.active.as_ref().is_some_and(|view| view.ride_id == ride.id && !view.phase.is_final());
                if fold_view(&mut state.active, &ride, ActiveTripView::for_passenger)
                    && ride.status.is_terminal()
                    && was_live
                {
                    state.notice = Some(Notice::RideEnded {
                        ride_id: ride.id,
                        status: ride.status,
                    });
                }
                smallvec![Effect::None]
            },

            PassengerAction::RequestFailed { correlation_id, error } => {
                state.requests.reject(correlation_id);
                state.notice = Some(Notice::Rejected(error.to_string()));
                smallvec![Effect::None]
            },

            PassengerAction::Cancel { reason, free_text } => {
                let Some(ride_id) = state
                    .active
                    .as_ref()
                    .filter(|view| !view.phase.is_final())
                    .map(|view| view.ride_id)
                else {
                    state.notice = Some(Notice::Rejected("no ride to cancel".to_string()));
                    return smallvec![Effect::None];
                };
                let service = env.service.clone();
                let caller = Party::Passenger(state.passenger_id);
                let request = CancelRequest { reason, free_text };
                smallvec![async_effect! {
                    match service.cancel(caller, ride_id, request).await {
                        Ok(record) => Some(PassengerAction::Cancelled { record }),
                        Err(error) => Some(PassengerAction::CommandFailed { ride_id, error }),
                    }
                }]
            },

            PassengerAction::Cancelled { record } => {
                let status = if record.applied {
                    RideStatus::CancelledByPassenger
                } else {
                    record.status_at_cancel
                };
                state.notice = Some(Notice::RideEnded {
                    ride_id: record.ride_id,
                    status,
                });
                // The stored record follows as a change; refresh now in case it never does
                let service = env.service.clone();
                let ride_id = record.ride_id;
                smallvec![async_effect! {
                    service
                        .env()
                        .store
                        .get(ride_id)
                        .await
                        .ok()
                        .map(|ride| PassengerAction::RideChanged { ride })
                }]
            },

            PassengerAction::Recover => {
                let service = env.service.clone();
                let passenger_id = state.passenger_id;
                smallvec![async_effect! {
                    match service.recover_for_passenger(passenger_id).await {
                        Ok(view) => Some(PassengerAction::Recovered { view }),
                        Err(error) => {
                            tracing::warn!(passenger_id = %passenger_id, error = %error, "Passenger recovery failed");
                            None
                        },
                    }
                }]
            },

            PassengerAction::Recovered { view } => {
                // Keep a finished ride on screen if the store has nothing live
                if view.is_some() || state.active.as_ref().is_some_and(|shown| !shown.phase.is_final()) {
                    state.active = view;
                }
                smallvec![Effect::None]
            },

            PassengerAction::CommandFailed { ride_id, error } => {
                if !error.is_conflict() {
                    state.notice = Some(Notice::Rejected(error.to_string()));
                    return smallvec![Effect::None];
                }
                tracing::debug!(ride_id = %ride_id, error = %error, "Passenger command lost a race");
                state.notice = Some(Notice::RideMovedOn(ride_id));
                let service = env.service.clone();
                let passenger_id = state.passenger_id;
                smallvec![async_effect! {
                    service
                        .recover_for_passenger(passenger_id)
                        .await
                        .ok()
                        .map(|view| PassengerAction::Recovered { view })
                }]
            },
        }
    }
}

/// Local stand-in shown until the store answers; version 0 loses to any
/// stored record.
fn provisional(payload: &NewRideRequest, env: &SessionEnvironment) -> RideRequest {
    let fare = payload.estimated_fare.unwrap_or(Money::ZERO);
    let mut ride = RideRequest::new_pending(RideId::new(), payload.clone(), fare, env.clock.now());
    ride.version = 0;
    ride
}

fn retry_effect(
    state: &PassengerSession,
    env: &SessionEnvironment,
    ride_id: RideId,
    correlation_id: CorrelationId,
) -> SmallVec<[Effect<PassengerAction>; 4]> {
    let service = env.service.clone();
    let passenger_id = state.passenger_id;
    smallvec![async_effect! {
        match service.retry(passenger_id, ride_id, Some(correlation_id)).await {
            Ok(ride) => Some(PassengerAction::RideCreated { ride }),
            Err(error) => Some(PassengerAction::RequestFailed { correlation_id, error }),
        }
    }]
}
