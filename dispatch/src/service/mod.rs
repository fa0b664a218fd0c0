//! Ride services - the operations clients invoke against the shared store.
//!
//! Every mutation is a single conditional update. Nothing here holds a lock
//! across writers or reads a ride and writes it back without a predicate, so
//! any number of `RideService` instances (in one process or many) can work on
//! the same store:
//!
//! 1. Build the predicate the write depends on
//! 2. Issue the conditional update
//! 3. Treat `Conflict` as "someone else got there first" and report it
//! 4. Start follow-up work (fan-out, route caching, timers) in the background

mod abandonment;
mod acceptance;
mod cancellation;
mod dispatch;
mod phases;
mod recovery;
mod requests;
mod tasks;

pub use cancellation::CancelRequest;
pub use dispatch::offer_for;
pub use phases::PHASE_TARGETS;
pub use tasks::{BackgroundTasks, TimerRegistry};

use crate::environment::DispatchEnvironment;
use std::sync::Arc;

/// Entry point for every ride operation.
///
/// Cheap to clone; clones share the background task set and the timers.
#[derive(Clone, Debug)]
pub struct RideService {
    env: DispatchEnvironment,
    timers: Arc<TimerRegistry>,
    tasks: Arc<BackgroundTasks>,
}

impl RideService {
    /// Service over `env`
    #[must_use]
    pub fn new(env: DispatchEnvironment) -> Self {
        Self {
            env,
            timers: Arc::new(TimerRegistry::default()),
            tasks: Arc::new(BackgroundTasks::default()),
        }
    }

    /// The injected dependencies
    #[must_use]
    pub const fn env(&self) -> &DispatchEnvironment {
        &self.env
    }

    /// Passenger wait timers currently armed
    #[must_use]
    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Wait for fan-out and route caching started so far.
    ///
    /// Timers are not waited for.
    pub async fn settle(&self) {
        self.tasks.settle().await;
    }

    /// Abort timers and background work.
    ///
    /// Safe at any point: a timer that never fires leaves its ride `pending`,
    /// and [`RideService::rearm_pending`] picks it up on the next start.
    pub fn shutdown(&self) {
        let timers = self.timers.len();
        let tasks = self.tasks.len();
        self.timers.abort_all();
        self.tasks.abort_all();
        tracing::info!(timers, tasks, "Ride service stopped");
    }
}
