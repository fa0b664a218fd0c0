//! # Ride Dispatch Runtime
//!
//! Store runtime that drives the client session reducers.
//!
//! The Store holds one session's state, runs its reducer for every action and
//! executes the returned effects. Actions produced by effects are broadcast to
//! observers and fed back into the reducer.
//!
//! ## Core Components
//!
//! - **Store**: state, reducer, environment and the effect executor
//! - **Cancellable effects**: popup timers and other effects that a later
//!   action stops through `Effect::Cancel`
//! - **Retry / metrics**: shared helpers for the dispatch services
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_runtime::Store;
//!
//! let store = Store::new(DriverSession::new(driver_id), DriverSessionReducer, env);
//!
//! store.send(DriverAction::OfferReceived { offer }).await?;
//!
//! let open = store.state(|s| s.offers.len()).await;
//! ```

use ride_dispatch_core::effect::{Effect, EffectId};
use ride_dispatch_core::reducer::Reducer;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::AbortHandle;

pub mod metrics;
pub mod retry;

use metrics::SessionMetrics;

/// Session store errors
pub mod error {
    use thiserror::Error;

    /// Why a session store refused or gave up on a request
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// An effect task panicked
        #[error("session effect panicked: {0}")]
        TaskJoinError(#[from] tokio::task::JoinError),

        /// The session is closing and takes no more actions
        #[error("session is closing")]
        ShutdownInProgress,

        /// Effects were still running when the close deadline passed
        #[error("{0} session effects outlived the close deadline")]
        ShutdownTimeout(usize),

        /// Nothing matching arrived in time
        #[error("timed out waiting on the session")]
        Timeout,

        /// The action broadcast closed under a waiter
        #[error("session action feed closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

/// Completion of the effects started by one [`Store::send`].
///
/// Only the action's own effects are counted, including the reduce of the
/// action they feed back. A cancelled effect counts as done.
///
/// ```ignore
/// let mut handle = store.send(PassengerAction::Recover).await?;
/// handle.wait_with_timeout(Duration::from_secs(5)).await?;
/// ```
#[derive(Clone)]
pub struct EffectHandle {
    outstanding: Arc<AtomicUsize>,
    settled: watch::Receiver<()>,
}

impl EffectHandle {
    fn pair() -> (Self, ActionEffects) {
        let outstanding = Arc::new(AtomicUsize::new(0));
        let (signal, settled) = watch::channel(());
        let handle = Self {
            outstanding: Arc::clone(&outstanding),
            settled,
        };
        (handle, ActionEffects { outstanding, signal })
    }

    /// A handle with nothing to wait for
    #[must_use]
    pub fn completed() -> Self {
        Self::pair().0
    }

    /// Effects of this action still running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every effect of this action has finished
    pub async fn wait(&mut self) {
        while self.pending() > 0 && self.settled.changed().await.is_ok() {}
    }

    /// [`wait`](Self::wait), bounded by `timeout`
    ///
    /// # Errors
    ///
    /// [`StoreError::Timeout`] when effects are still running at the deadline.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StoreError::Timeout)
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Write side of an [`EffectHandle`]
#[derive(Clone)]
struct ActionEffects {
    outstanding: Arc<AtomicUsize>,
    signal: watch::Sender<()>,
}

/// One running effect task, counted for its action and for the whole store.
///
/// Dropped on completion, panic and abort alike.
struct InFlight {
    action: ActionEffects,
    store: Arc<AtomicUsize>,
}

impl InFlight {
    fn start(action: &ActionEffects, store: &Arc<AtomicUsize>) -> Self {
        action.outstanding.fetch_add(1, Ordering::SeqCst);
        store.fetch_add(1, Ordering::SeqCst);
        Self {
            action: action.clone(),
            store: Arc::clone(store),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.store.fetch_sub(1, Ordering::SeqCst);
        if self.action.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.action.signal.send(());
        }
    }
}

/// Running cancellable effects, keyed by id.
///
/// The generation lets a finished task remove its own entry without removing
/// a newer effect registered under the same id.
#[derive(Default)]
struct CancellableRegistry {
    next_generation: AtomicU64,
    running: Mutex<HashMap<EffectId, (u64, AbortHandle)>>,
}

impl CancellableRegistry {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<EffectId, (u64, AbortHandle)>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aborts the effect registered under `id`. Returns whether one was still running.
    fn cancel(&self, id: &EffectId) -> bool {
        match self.running().remove(id) {
            Some((_, handle)) => {
                let was_running = !handle.is_finished();
                handle.abort();
                was_running
            },
            None => false,
        }
    }

    fn finish(&self, id: &EffectId, generation: u64) {
        let mut running = self.running();
        if running.get(id).is_some_and(|(current, _)| *current == generation) {
            running.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.running().len()
    }
}

type BoxedRun = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The session store
pub mod store {
    use super::{
        ActionEffects, Arc, AtomicBool, AtomicUsize, BoxedRun, CancellableRegistry, Duration,
        Effect, EffectHandle, InFlight, Ordering, Reducer, RwLock, SessionMetrics, StoreError,
    };
    use tokio::sync::broadcast;

    /// Default capacity of the action broadcast channel
    const DEFAULT_BROADCAST_CAPACITY: usize = 16;

    /// One client session: its state, reducer and environment.
    ///
    /// Actions are reduced one at a time under a write lock. Effects run on
    /// spawned tasks, and whatever action they produce is broadcast and then
    /// reduced like any other. Cheap to clone; clones share the session.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        cancellables: Arc<CancellableRegistry>,
        /// Every action produced by an effect is broadcast here before it is
        /// fed back into the reducer.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        /// Session starting from `initial_state`
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_broadcast_capacity(
                initial_state,
                reducer,
                environment,
                DEFAULT_BROADCAST_CAPACITY,
            )
        }

        /// Like [`Store::new`] with room for `capacity` unread broadcast
        /// actions; slower subscribers skip ahead.
        #[must_use]
        pub fn with_broadcast_capacity(
            initial_state: S,
            reducer: R,
            environment: E,
            capacity: usize,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(capacity.max(1));
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                cancellables: Arc::new(CancellableRegistry::default()),
                action_broadcast,
            }
        }

        /// Reduce `action` and start its effects.
        ///
        /// Returns once the effects are started; the handle tracks them.
        ///
        /// # Errors
        ///
        /// [`StoreError::ShutdownInProgress`] once [`Store::shutdown`] began.
        #[tracing::instrument(skip(self, action), name = "session_send")]
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::debug!("Session closing, action dropped");
                return Err(StoreError::ShutdownInProgress);
            }

            let (handle, effects_of_action) = EffectHandle::pair();
            let effects = {
                let mut state = self.state.write().await;
                let started = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut state, action, &self.environment);
                SessionMetrics::record_action(started.elapsed());
                effects
            };
            tracing::trace!(effects = effects.len(), "Action reduced");

            for effect in effects {
                self.execute_effect(effect, &effects_of_action);
            }
            Ok(handle)
        }

        /// Send `action`, then wait for an effect to produce one matching
        /// `predicate`. The match is broadcast before it is reduced.
        ///
        /// # Errors
        ///
        /// [`StoreError::Timeout`] when nothing matches in time,
        /// [`StoreError::ChannelClosed`] if the feed closes, and the errors of
        /// [`Store::send`].
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            F: Fn(&A) -> bool,
        {
            // Subscribed first so a fast effect is not missed
            let mut produced = self.action_broadcast.subscribe();
            self.send(action).await?;

            let matching = async {
                loop {
                    match produced.recv().await {
                        Ok(candidate) if predicate(&candidate) => break Ok(candidate),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Waiter fell behind the session feed");
                        },
                        Err(broadcast::error::RecvError::Closed) => break Err(StoreError::ChannelClosed),
                    }
                }
            };
            tokio::time::timeout(timeout, matching)
                .await
                .unwrap_or(Err(StoreError::Timeout))
        }

        /// Every action an effect produces; directly sent actions are not included
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Project the current state, e.g. `store.state(|s| s.offers.len())`
        pub async fn state<F, T>(&self, read: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            read(&*self.state.read().await)
        }

        /// Number of cancellable effects currently registered
        #[must_use]
        pub fn running_cancellables(&self) -> usize {
            self.cancellables.len()
        }

        /// Close the session.
        ///
        /// New actions are refused and timers are aborted, then running
        /// effects get until `timeout` to finish.
        ///
        /// # Errors
        ///
        /// [`StoreError::ShutdownTimeout`] with the number of effects still
        /// running at the deadline.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            self.shutdown.store(true, Ordering::Release);
            let timers: Vec<_> = self.cancellables.running().keys().cloned().collect();
            tracing::debug!(timers = timers.len(), "Closing session");
            for id in &timers {
                self.cancellables.cancel(id);
            }

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let running = self.pending_effects.load(Ordering::Acquire);
                if running == 0 {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(running, "Session effects outlived the close deadline");
                    return Err(StoreError::ShutdownTimeout(running));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        /// Broadcast an effect-produced action and feed it back in
        async fn feed_back(&self, action: A) {
            let _ = self.action_broadcast.send(action.clone());
            if let Err(error) = self.send(action).await {
                tracing::debug!(error = %error, "Dropped action produced by effect");
            }
        }

        /// Start an effect in the background.
        ///
        /// Reducer panics propagate; effect failures are logged and never
        /// halt the store.
        fn execute_effect(&self, effect: Effect<A>, tracking: &ActionEffects) {
            match effect {
                Effect::None => {
                    SessionMetrics::record_effect("none");
                },
                Effect::Parallel(effects) => {
                    SessionMetrics::record_effect("parallel");
                    for effect in effects {
                        self.execute_effect(effect, tracking);
                    }
                },
                Effect::Cancel(id) => {
                    SessionMetrics::record_effect("cancel");
                    if self.cancellables.cancel(&id) {
                        SessionMetrics::record_cancelled();
                        tracing::debug!(effect_id = %id, "Cancelled running effect");
                    }
                },
                Effect::Cancellable { id, effect } => {
                    SessionMetrics::record_effect("cancellable");
                    let store = self.clone();
                    let registry = Arc::clone(&self.cancellables);
                    let generation = registry.next_generation.fetch_add(1, Ordering::Relaxed);

                    // Registry lock is held across spawn so the task cannot
                    // finish before its entry exists.
                    let mut running = registry.running();
                    let task_id = id.clone();
                    let task_registry = Arc::clone(&registry);
                    let handle = self.spawn_tracked(tracking, async move {
                        store.run_inline(*effect).await;
                        task_registry.finish(&task_id, generation);
                    });
                    if let Some((_, previous)) = running.insert(id.clone(), (generation, handle)) {
                        if !previous.is_finished() {
                            SessionMetrics::record_cancelled();
                            tracing::debug!(effect_id = %id, "Replaced running effect");
                        }
                        previous.abort();
                    }
                },
                other => {
                    let store = self.clone();
                    self.spawn_tracked(tracking, async move {
                        store.run_inline(other).await;
                    });
                },
            }
        }

        /// Spawn an effect task counted by the action's handle and by shutdown.
        fn spawn_tracked<F>(&self, tracking: &ActionEffects, task: F) -> tokio::task::AbortHandle
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
            let in_flight = InFlight::start(tracking, &self.pending_effects);
            tokio::spawn(async move {
                let _in_flight = in_flight;
                task.await;
            })
            .abort_handle()
        }

        /// Run an effect to completion inside the current task.
        fn run_inline(&self, effect: Effect<A>) -> BoxedRun {
            let store = self.clone();
            Box::pin(async move {
                match effect {
                    Effect::None => {},
                    Effect::Future(fut) => {
                        SessionMetrics::record_effect("future");
                        if let Some(action) = fut.await {
                            store.feed_back(action).await;
                        }
                    },
                    Effect::Delay { duration, action } => {
                        SessionMetrics::record_effect("delay");
                        tokio::time::sleep(duration).await;
                        store.feed_back(*action).await;
                    },
                    Effect::Parallel(effects) => {
                        let runs = effects.into_iter().map(|effect| store.run_inline(effect));
                        futures::future::join_all(runs).await;
                    },
                    Effect::Sequential(effects) => {
                        SessionMetrics::record_effect("sequential");
                        for effect in effects {
                            store.run_inline(effect).await;
                        }
                    },
                    Effect::Cancellable { effect, .. } => {
                        // Nested cancellables run under the outer one's handle
                        store.run_inline(*effect).await;
                    },
                    Effect::Cancel(id) => {
                        if store.cancellables.cancel(&id) {
                            SessionMetrics::record_cancelled();
                        }
                    },
                }
            })
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                cancellables: Arc::clone(&self.cancellables),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

pub use store::Store;

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use ride_dispatch_core::{SmallVec, async_effect, cancellable, delay, smallvec};

    #[derive(Debug, Clone, Default)]
    struct TimerState {
        armed: u32,
        fired: Vec<u32>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TimerAction {
        Arm { id: u32, after: Duration },
        Disarm { id: u32 },
        Fired { id: u32 },
        Ping,
        Pong,
        Both,
    }

    #[derive(Clone)]
    struct TimerReducer;

    impl Reducer for TimerReducer {
        type State = TimerState;
        type Action = TimerAction;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut TimerState,
            action: TimerAction,
            _env: &(),
        ) -> SmallVec<[Effect<TimerAction>; 4]> {
            match action {
                TimerAction::Arm { id, after } => {
                    state.armed += 1;
                    smallvec![cancellable! {
                        id: EffectId::scoped("timer", id),
                        effect: delay! { duration: after, action: TimerAction::Fired { id } }
                    }]
                },
                TimerAction::Disarm { id } => {
                    smallvec![Effect::Cancel(EffectId::scoped("timer", id))]
                },
                TimerAction::Fired { id } => {
                    state.fired.push(id);
                    smallvec![Effect::None]
                },
                TimerAction::Ping => smallvec![async_effect! { Some(TimerAction::Pong) }],
                TimerAction::Pong => smallvec![Effect::None],
                TimerAction::Both => smallvec![Effect::chain(vec![
                    async_effect! { Some(TimerAction::Fired { id: 1 }) },
                    async_effect! { Some(TimerAction::Fired { id: 2 }) },
                ])],
            }
        }
    }

    fn store() -> Store<TimerState, TimerAction, (), TimerReducer> {
        Store::new(TimerState::default(), TimerReducer, ())
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_action_feeds_back() {
        let store = store();
        let mut handle = store
            .send(TimerAction::Arm {
                id: 1,
                after: Duration::from_secs(15),
            })
            .await
            .unwrap();
        handle.wait().await;

        assert_eq!(store.state(|s| s.fired.clone()).await, vec![1]);
        assert_eq!(store.running_cancellables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_timer_before_it_fires() {
        let store = store();
        let mut handle = store
            .send(TimerAction::Arm {
                id: 7,
                after: Duration::from_secs(15),
            })
            .await
            .unwrap();
        store.send(TimerAction::Disarm { id: 7 }).await.unwrap();
        handle.wait().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.state(|s| s.fired.is_empty()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_running_timer() {
        let store = store();
        let mut first = store
            .send(TimerAction::Arm {
                id: 3,
                after: Duration::from_secs(10),
            })
            .await
            .unwrap();
        let mut second = store
            .send(TimerAction::Arm {
                id: 3,
                after: Duration::from_secs(20),
            })
            .await
            .unwrap();
        first.wait().await;
        second.wait().await;

        let state = store.state(Clone::clone).await;
        assert_eq!(state.armed, 2);
        assert_eq!(state.fired, vec![3]);
    }

    #[tokio::test]
    async fn cancelling_unknown_id_is_noop() {
        let store = store();
        let mut handle = store.send(TimerAction::Disarm { id: 99 }).await.unwrap();
        handle.wait().await;
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn send_and_wait_for_returns_effect_action() {
        let store = store();
        let action = store
            .send_and_wait_for(
                TimerAction::Ping,
                |a| matches!(a, TimerAction::Pong),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(action, TimerAction::Pong);
    }

    #[tokio::test]
    async fn sequential_effects_keep_order() {
        let store = store();
        let mut rx = store.subscribe_actions();
        let mut handle = store.send(TimerAction::Both).await.unwrap();
        handle.wait().await;

        assert_eq!(rx.recv().await.unwrap(), TimerAction::Fired { id: 1 });
        assert_eq!(rx.recv().await.unwrap(), TimerAction::Fired { id: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_timers_and_rejects_actions() {
        let store = store();
        store
            .send(TimerAction::Arm {
                id: 1,
                after: Duration::from_secs(3600),
            })
            .await
            .unwrap();

        store.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            store.send(TimerAction::Ping).await,
            Err(StoreError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn completed_handle_does_not_wait() {
        let mut handle = EffectHandle::completed();
        handle
            .wait_with_timeout(Duration::from_millis(10))
            .await
            .unwrap();
    }
}
