//! # Ride Dispatch Core
//!
//! Ride request model, lifecycle state machine and collaborator traits.
//!
//! The only shared mutable record is the [`ride::RideRequest`]. Everything
//! that changes it goes through a conditional update against a
//! [`store::RideRequestStore`]; there is no in-process lock spanning writers
//! and no privileged writer. Client-side state (driver and passenger
//! sessions) is modelled with the reducer/effect abstractions defined here
//! and executed by the runtime crate.
//!
//! ## Core Concepts
//!
//! - **RideStatus**: the lifecycle state machine ([`status`])
//! - **RidePredicate / RidePatch**: the two halves of a conditional update ([`ride`])
//! - **TripPhase**: the client-facing phase, derived by one total function ([`phase`])
//! - **Reducer / Effect**: client sessions as `(State, Action, Environment) → (State, Effects)`
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_core::*;
//!
//! impl Reducer for DriverSessionReducer {
//!     type State = DriverSession;
//!     type Action = DriverAction;
//!     type Environment = SessionEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut DriverSession,
//!         action: DriverAction,
//!         env: &SessionEnvironment,
//!     ) -> SmallVec<[Effect<DriverAction>; 4]> {
//!         smallvec![Effect::None]
//!     }
//! }
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

/// Identifiers, parties, money and locations
pub mod types;

/// The ride status state machine
pub mod status;

/// The ride request aggregate, patches and predicates
pub mod ride;

/// Polyline encoding and distance
pub mod geo;

/// Trip phase derivation and the active trip view
pub mod phase;

/// Ride store trait and change feed
pub mod store;

/// Append-only cancellation log
pub mod cancellation;

/// External collaborator traits
pub mod collaborators;

/// Error taxonomy for ride operations
pub mod error;

/// Declarative macros for effect construction
#[macro_use]
pub mod effect_macros;

/// Client session logic as plain functions of state and action
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// Session logic: `(state, action, environment) -> (state', effects)`.
    ///
    /// A reducer never awaits. Anything that talks to the ride service is
    /// returned as an [`Effect`] and its outcome comes back as another
    /// action, so every session transition is testable without a runtime.
    pub trait Reducer {
        /// Session state
        type State;

        /// Everything that can happen to the session
        type Action;

        /// Services the effects call into
        type Environment;

        /// Apply `action` to `state` and describe the follow-up work.
        ///
        /// Sessions rarely return more than four effects, hence the inline
        /// capacity.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Work a reducer asks the runtime to do
pub mod effect {
    use std::fmt;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Identifies a cancellable effect.
    ///
    /// Scheduling a second effect under an id that is still running replaces
    /// the first one.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EffectId(String);

    impl EffectId {
        /// Creates an id from a raw key
        #[must_use]
        pub fn new(key: impl Into<String>) -> Self {
            Self(key.into())
        }

        /// Creates an id scoped to an entity, e.g. `offer/<ride id>`
        #[must_use]
        pub fn scoped(scope: &str, entity: impl fmt::Display) -> Self {
            Self(format!("{scope}/{entity}"))
        }

        /// The raw key
        #[must_use]
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for EffectId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// A description of work, run later by the session store.
    ///
    /// Any action an effect yields is fed back into the same reducer.
    pub enum Effect<Action> {
        /// Nothing to do
        None,

        /// All at once
        Parallel(Vec<Effect<Action>>),

        /// One after another, each finishing before the next starts
        Sequential(Vec<Effect<Action>>),

        /// Produce `action` after `duration`, e.g. an offer popup expiring
        Delay {
            /// Wait
            duration: Duration,
            /// Produced when the wait ends
            action: Box<Action>,
        },

        /// A service call; `Some(action)` reports the outcome
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// Effect that can be stopped with [`Effect::Cancel`]
        Cancellable {
            /// Handle used to cancel
            id: EffectId,
            /// The wrapped effect
            effect: Box<Effect<Action>>,
        },

        /// Stop the cancellable effect with this id, if still running.
        ///
        /// Cancelling an unknown or finished id is a no-op.
        Cancel(EffectId),
    }

    impl<Action> fmt::Debug for Effect<Action>
    where
        Action: fmt::Debug,
    {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::Cancellable { id, effect } => f
                    .debug_struct("Effect::Cancellable")
                    .field("id", id)
                    .field("effect", effect)
                    .finish(),
                Effect::Cancel(id) => f.debug_tuple("Effect::Cancel").field(id).finish(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// [`Effect::Parallel`]
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// [`Effect::Sequential`]
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Whether this is `Effect::None`
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// Injected time source
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Source of "now" for timestamps, timeouts and wait windows.
    ///
    /// Stores and services take one so tests can move time by hand.
    pub trait Clock: Send + Sync {
        /// Current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
