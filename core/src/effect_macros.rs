//! Shorthand for the effects session reducers return.
//!
//! `ride_update!` is the one with substance: a conditional write whose
//! outcome, success or refusal, comes back to the reducer as an action.

/// Create an `Effect::Future` that performs a conditional ride update
///
/// The store expression must be an `Arc<dyn RideRequestStore>` (or any `Arc`
/// of a store); it is cloned into the effect.
///
/// # Example
///
/// ```rust,ignore
/// use ride_dispatch_core::ride_update;
///
/// ride_update! {
///     store: env.store,
///     ride: ride_id,
///     expected: RidePredicate::status_is(RideStatus::Pending).driver_unassigned(),
///     patch: RidePatch::accept(driver_id, env.clock.now()),
///     on_success: |ride| Some(DriverAction::AcceptCommitted { ride }),
///     on_error: |error| Some(DriverAction::AcceptRejected { ride_id, error: error.into() })
/// }
/// ```
#[macro_export]
macro_rules! ride_update {
    (
        store: $store:expr,
        ride: $ride:expr,
        expected: $expected:expr,
        patch: $patch:expr,
        on_success: |$success_param:ident| $success_body:expr,
        on_error: |$error_param:ident| $error_body:expr
    ) => {{
        let store = ::std::sync::Arc::clone(&$store);
        let ride_id = $ride;
        let expected = $expected;
        let patch = $patch;
        $crate::effect::Effect::Future(::std::boxed::Box::pin(async move {
            let outcome = $crate::store::RideRequestStore::conditional_update(
                &*store, ride_id, expected, patch,
            )
            .await;
            match outcome {
                Ok($success_param) => $success_body,
                Err($error_param) => $error_body,
            }
        }))
    }};
}

/// `Effect::Future` around an async block yielding `Option<Action>`
///
/// # Example
///
/// ```rust,ignore
/// use ride_dispatch_core::async_effect;
///
/// async_effect! {
///     let ride = store.get(ride_id).await.ok()?;
///     Some(PassengerAction::Refreshed { ride })
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

/// `Effect::Delay`: produce an action once a wait ends
///
/// # Example
///
/// ```rust,ignore
/// use ride_dispatch_core::delay;
/// use std::time::Duration;
///
/// delay! {
///     duration: Duration::from_secs(15),
///     action: DriverAction::OfferExpired { ride_id }
/// }
/// ```
#[macro_export]
macro_rules! delay {
    (
        duration: $duration:expr,
        action: $action:expr
    ) => {
        $crate::effect::Effect::Delay {
            duration: $duration,
            action: ::std::boxed::Box::new($action),
        }
    };
}

/// Wrap an effect so a later `Effect::Cancel` with the same id stops it
///
/// # Example
///
/// ```rust,ignore
/// use ride_dispatch_core::{cancellable, delay};
///
/// cancellable! {
///     id: EffectId::scoped("offer", ride_id),
///     effect: delay! { duration: popup, action: DriverAction::OfferExpired { ride_id } }
/// }
/// ```
#[macro_export]
macro_rules! cancellable {
    (
        id: $id:expr,
        effect: $effect:expr
    ) => {
        $crate::effect::Effect::Cancellable {
            id: $id,
            effect: ::std::boxed::Box::new($effect),
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::effect::{Effect, EffectId};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    enum OfferAction {
        Fetched { rides: usize },
        PopupExpired,
    }

    #[test]
    fn async_block_becomes_a_future() {
        let effect = async_effect! { Some(OfferAction::Fetched { rides: 3 }) };
        assert!(matches!(effect, Effect::Future(_)));
    }

    #[test]
    #[allow(clippy::panic)] // Test code
    fn async_effect_yields_its_action() {
        match async_effect! { Some(OfferAction::Fetched { rides: 3 }) } {
            Effect::Future(future) => assert!(matches!(
                futures::executor::block_on(future),
                Some(OfferAction::Fetched { rides: 3 })
            )),
            other => panic!("expected a future, got {other:?}"),
        }
    }

    #[test]
    #[allow(clippy::panic)] // Test code
    fn popup_timer_is_a_cancellable_delay() {
        let effect = cancellable! {
            id: EffectId::scoped("offer", 42),
            effect: delay! {
                duration: Duration::from_secs(15),
                action: OfferAction::PopupExpired
            }
        };

        let (id, inner) = match effect {
            Effect::Cancellable { id, effect } => (id, effect),
            other => panic!("expected a cancellable effect, got {other:?}"),
        };
        assert_eq!(id.as_str(), "offer/42");
        match *inner {
            Effect::Delay { duration, action } => {
                assert_eq!(duration, Duration::from_secs(15));
                assert!(matches!(*action, OfferAction::PopupExpired));
            },
            other => panic!("expected a delay, got {other:?}"),
        }
    }
}
