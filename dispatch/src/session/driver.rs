//! Driver client session: offers, popup timers, the acceptance race and
//! trip phases.

use super::{Notice, SessionEnvironment, fold_view};
use crate::service::CancelRequest;
use ride_dispatch_core::cancellation::{CancellationReason, CancellationRecord};
use ride_dispatch_core::collaborators::RideOffer;
use ride_dispatch_core::effect::{Effect, EffectId};
use ride_dispatch_core::error::RideError;
use ride_dispatch_core::phase::ActiveTripView;
use ride_dispatch_core::reducer::Reducer;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{DriverId, Location, Party, RideId};
use ride_dispatch_core::{async_effect, cancellable, delay};
use smallvec::{SmallVec, smallvec};
use std::collections::HashSet;

/// Id of the popup timer for `ride_id`
#[must_use]
pub fn popup_timer(ride_id: RideId) -> EffectId {
    EffectId::scoped("offer", ride_id)
}

/// What one driver's client shows.
#[derive(Clone, Debug, PartialEq)]
pub struct DriverSession {
    /// The signed-in driver
    pub driver_id: DriverId,
    /// Offers on screen, oldest first
    pub offers: Vec<RideOffer>,
    /// Offers declined or timed out; never shown again
    pub dismissed: HashSet<RideId>,
    /// The ride being driven
    pub active: Option<ActiveTripView>,
    /// Last message for the driver
    pub notice: Option<Notice>,
}

impl DriverSession {
    /// Idle session for `driver_id`
    #[must_use]
    pub fn new(driver_id: DriverId) -> Self {
        Self {
            driver_id,
            offers: Vec::new(),
            dismissed: HashSet::new(),
            active: None,
            notice: None,
        }
    }

    /// Whether a ride is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(|view| !view.phase.is_final())
    }

    /// Id of the ride being driven
    #[must_use]
    pub fn active_ride(&self) -> Option<RideId> {
        self.active
            .as_ref()
            .filter(|view| !view.phase.is_final())
            .map(|view| view.ride_id)
    }

    fn take_offer(&mut self, ride_id: RideId) -> Option<RideOffer> {
        let index = self.offers.iter().position(|offer| offer.ride_id == ride_id)?;
        Some(self.offers.remove(index))
    }
}

/// Which command a failure belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverCommand {
    /// Accept an offer
    Accept,
    /// Move the trip forward
    Advance,
    /// Report a passenger no-show
    NoShow,
    /// Cancel the ride
    Cancel,
}

/// Driver session actions.
#[derive(Clone, Debug)]
pub enum DriverAction {
    // Commands
    /// A push notification arrived
    OfferReceived {
        /// The offer
        offer: RideOffer,
    },
    /// The driver dismissed an offer
    Decline {
        /// The offered ride
        ride_id: RideId,
    },
    /// The driver tapped accept
    Accept {
        /// The offered ride
        ride_id: RideId,
    },
    /// Move the active ride to the next phase
    Advance {
        /// Phase status to move to
        target: RideStatus,
        /// Current driver position, used for the route to the pickup point
        position: Option<Location>,
    },
    /// End the active ride because the passenger never came
    ReportNoShow,
    /// Cancel the active ride
    Cancel {
        /// Reason code
        reason: CancellationReason,
        /// Free text, required for `other`
        free_text: Option<String>,
    },
    /// Reload the active ride from the store
    Recover,

    // Effect results
    /// The popup for an offer timed out
    PopupExpired {
        /// The offered ride
        ride_id: RideId,
    },
    /// The acceptance race was won
    Accepted {
        /// The ride as stored
        ride: RideRequest,
    },
    /// A phase command or no-show was stored
    Advanced {
        /// The ride as stored
        ride: RideRequest,
    },
    /// The cancellation was logged
    Cancelled {
        /// The log entry
        record: CancellationRecord,
    },
    /// A fresh snapshot of a ride this driver cares about
    RideChanged {
        /// The ride as stored
        ride: RideRequest,
    },
    /// Recovery finished
    Recovered {
        /// The driver's live ride, if any
        view: Option<ActiveTripView>,
    },
    /// A command failed
    CommandFailed {
        /// Which command
        command: DriverCommand,
        /// The ride it targeted
        ride_id: RideId,
        /// Why
        error: RideError,
    },
}

/// Reducer for [`DriverSession`].
#[derive(Clone, Debug, Default)]
pub struct DriverSessionReducer;

impl DriverSessionReducer {
    /// Create the reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Reducer for DriverSessionReducer {
    type State = DriverSession;
    type Action = DriverAction;
    type Environment = SessionEnvironment;

    #[allow(clippy::too_many_lines)] // one arm per action
    fn reduce(
        &self,
        state: &mut DriverSession,
        action: DriverAction,
        env: &SessionEnvironment,
    ) -> SmallVec<[Effect<DriverAction>; 4]> {
        match action {
            DriverAction::OfferReceived { offer } => {
                let ride_id = offer.ride_id;
                if state.is_busy()
                    || state.dismissed.contains(&ride_id)
                    || state.offers.iter().any(|shown| shown.ride_id == ride_id)
                {
                    return smallvec![Effect::None];
                }
                state.offers.push(offer);
                smallvec![cancellable!(
                    id: popup_timer(ride_id),
                    effect: delay!(
                        duration: env.popup_timeout,
                        action: DriverAction::PopupExpired { ride_id }
                    )
                )]
            },

            DriverAction::Decline { ride_id } | DriverAction::PopupExpired { ride_id } => {
                // Repeated expiry of the same offer is harmless
                state.take_offer(ride_id);
                state.dismissed.insert(ride_id);
                smallvec![Effect::Cancel(popup_timer(ride_id))]
            },

            DriverAction::Accept { ride_id } => {
                if state.is_busy() {
                    state.notice = Some(Notice::Rejected("finish the current ride first".to_string()));
                    return smallvec![Effect::None];
                }
                state.take_offer(ride_id);
                let service = env.service.clone();
                let driver_id = state.driver_id;
                smallvec![
                    Effect::Cancel(popup_timer(ride_id)),
                    async_effect! {
                        match service.accept(driver_id, ride_id).await {
                            Ok(ride) => Some(DriverAction::Accepted { ride }),
                            Err(error) => Some(DriverAction::CommandFailed {
                                command: DriverCommand::Accept,
                                ride_id,
                                error,
                            }),
                        }
                    }
                ]
            },

            DriverAction::Accepted { ride } => {
                fold_view(&mut state.active, &ride, ActiveTripView::for_driver);
                state.notice = None;
                let mut effects: SmallVec<[Effect<DriverAction>; 4]> = state
                    .offers
                    .drain(..)
                    .map(|offer| Effect::Cancel(popup_timer(offer.ride_id)))
                    .collect();
                if effects.is_empty() {
                    effects.push(Effect::None);
                }
                effects
            },

            DriverAction::Advance { target, position } => {
                let Some(ride_id) = state.active_ride() else {
                    state.notice = Some(Notice::Rejected("no active ride".to_string()));
                    return smallvec![Effect::None];
                };
                let service = env.service.clone();
                let driver_id = state.driver_id;
                smallvec![async_effect! {
                    match service.advance_phase(driver_id, ride_id, target, position).await {
                        Ok(ride) => Some(DriverAction::Advanced { ride }),
                        Err(error) => Some(DriverAction::CommandFailed {
                            command: DriverCommand::Advance,
                            ride_id,
                            error,
                        }),
                    }
                }]
            },

            DriverAction::ReportNoShow => {
                let Some(ride_id) = state.active_ride() else {
                    state.notice = Some(Notice::Rejected("no active ride".to_string()));
                    return smallvec![Effect::None];
                };
                let service = env.service.clone();
                let driver_id = state.driver_id;
                smallvec![async_effect! {
                    match service.end_no_show(driver_id, ride_id).await {
                        Ok(ride) => Some(DriverAction::Advanced { ride }),
                        Err(error) => Some(DriverAction::CommandFailed {
                            command: DriverCommand::NoShow,
                            ride_id,
                            error,
                        }),
                    }
                }]
            },

            DriverAction::Cancel { reason, free_text } => {
                let Some(ride_id) = state.active_ride() else {
                    state.notice = Some(Notice::Rejected("no active ride".to_string()));
                    return smallvec![Effect::None];
                };
                let service = env.service.clone();
                let caller = Party::Driver(state.driver_id);
                let request = CancelRequest { reason, free_text };
                smallvec![async_effect! {
                    match service.cancel(caller, ride_id, request).await {
                        Ok(record) => Some(DriverAction::Cancelled { record }),
                        Err(error) => Some(DriverAction::CommandFailed {
                            command: DriverCommand::Cancel,
                            ride_id,
                            error,
                        }),
                    }
                }]
            },

            DriverAction::Advanced { ride } | DriverAction::RideChanged { ride } => {
                apply_snapshot(state, &ride)
            },

            DriverAction::Cancelled { record } => {
                if state.active_ride() == Some(record.ride_id) {
                    state.active = None;
                }
                // A cancel that lost the race reports the passenger's cancellation
                let status = if record.applied {
                    RideStatus::CancelledByDriver
                } else {
                    RideStatus::CancelledByPassenger
                };
                state.notice = Some(Notice::RideEnded {
                    ride_id: record.ride_id,
                    status,
                });
                smallvec![Effect::None]
            },

            DriverAction::Recover => {
                let service = env.service.clone();
                let driver_id = state.driver_id;
                smallvec![async_effect! {
                    match service.recover_for_driver(driver_id).await {
                        Ok(view) => Some(DriverAction::Recovered { view }),
                        Err(error) => {
                            tracing::warn!(driver_id = %driver_id, error = %error, "Driver recovery failed");
                            None
                        },
                    }
                }]
            },

            DriverAction::Recovered { view } => {
                state.active = view;
                smallvec![Effect::None]
            },

            DriverAction::CommandFailed {
                command,
                ride_id,
                error,
            } => {
                if !error.is_conflict() {
                    state.notice = Some(Notice::Rejected(error.to_string()));
                    return smallvec![Effect::None];
                }
                if command == DriverCommand::Accept {
                    state.dismissed.insert(ride_id);
                    state.notice = Some(Notice::AlreadyTaken(ride_id));
                    return smallvec![Effect::None];
                }

                // The ride moved on: go idle, then resync from the store
                tracing::debug!(ride_id = %ride_id, ?command, error = %error, "Driver command lost a race");
                state.active = None;
                state.notice = Some(Notice::RideMovedOn(ride_id));
                let service = env.service.clone();
                let driver_id = state.driver_id;
                smallvec![async_effect! {
                    service
                        .recover_for_driver(driver_id)
                        .await
                        .ok()
                        .map(|view| DriverAction::Recovered { view })
                }]
            },
        }
    }
}

fn apply_snapshot(state: &mut DriverSession, ride: &RideRequest) -> SmallVec<[Effect<DriverAction>; 4]> {
    // An offer that left `pending` can no longer be won
    if ride.status != RideStatus::Pending && state.take_offer(ride.id).is_some() {
        state.dismissed.insert(ride.id);
        return smallvec![Effect::Cancel(popup_timer(ride.id))];
    }

    if !ride.held_by(state.driver_id) {
        return smallvec![Effect::None];
    }

    let was_active = state.active_ride() == Some(ride.id);
    if fold_view(&mut state.active, ride, ActiveTripView::for_driver) && ride.status.is_terminal() && was_active {
        state.notice = Some(Notice::RideEnded {
            ride_id: ride.id,
            status: ride.status,
        });
    }
    smallvec![Effect::None]
}
