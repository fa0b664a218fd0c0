//! Fire-and-forget work and per-ride timers.

use ride_dispatch_core::types::RideId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::{AbortHandle, JoinHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Detached tasks whose failure never reaches the caller (fan-out, route caching).
///
/// Kept so tests and shutdown can wait for them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    /// Start `task` on the runtime
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(task));
    }

    /// Wait until every task started so far, and any they started, has finished
    pub async fn settle(&self) {
        loop {
            let batch: Vec<_> = std::mem::take(&mut *lock(&self.handles));
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                if let Err(error) = handle.await {
                    if error.is_panic() {
                        tracing::error!(error = %error, "Background task panicked");
                    }
                }
            }
        }
    }

    /// Number of tasks not yet reaped
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.handles)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Whether nothing is running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort everything still running
    pub fn abort_all(&self) {
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

/// One abortable timer per ride.
///
/// Arming a ride that already has a timer replaces it. A timer that fires
/// removes itself unless it has been replaced in the meantime.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    next_generation: AtomicU64,
    timers: Mutex<HashMap<RideId, (u64, AbortHandle)>>,
}

impl TimerRegistry {
    /// Run `timer` as the timer of `ride_id`
    pub fn arm<F>(self: &Arc<Self>, ride_id: RideId, timer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);

        // Hold the lock across spawn so a timer that fires at once cannot
        // try to remove itself before it is registered.
        let mut timers = lock(&self.timers);
        let handle = tokio::spawn(async move {
            timer.await;
            registry.finish(ride_id, generation);
        });
        if let Some((_, previous)) = timers.insert(ride_id, (generation, handle.abort_handle())) {
            previous.abort();
        }
    }

    /// Stop the timer of `ride_id`. Returns whether one was running.
    pub fn disarm(&self, ride_id: RideId) -> bool {
        match lock(&self.timers).remove(&ride_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            },
            None => false,
        }
    }

    /// Whether `ride_id` has a live timer
    #[must_use]
    pub fn is_armed(&self, ride_id: RideId) -> bool {
        lock(&self.timers).contains_key(&ride_id)
    }

    /// Number of live timers
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Whether no timer is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every timer
    pub fn abort_all(&self) {
        for (_, (_, handle)) in lock(&self.timers).drain() {
            handle.abort();
        }
    }

    fn finish(&self, ride_id: RideId, generation: u64) {
        let mut timers = lock(&self.timers);
        if timers.get(&ride_id).is_some_and(|(current, _)| *current == generation) {
            timers.remove(&ride_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fired_timer_removes_itself() {
        let registry = Arc::new(TimerRegistry::default());
        let ride_id = RideId::new();
        registry.arm(ride_id, tokio::time::sleep(Duration::from_secs(5)));
        assert!(registry.is_armed(ride_id));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!registry.is_armed(ride_id));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_old_timer() {
        let registry = Arc::new(TimerRegistry::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let ride_id = RideId::new();

        for _ in 0..2 {
            let fired = Arc::clone(&fired);
            registry.arm(ride_id, async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let registry = Arc::new(TimerRegistry::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let ride_id = RideId::new();
        let counter = Arc::clone(&fired);
        registry.arm(ride_id, async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.disarm(ride_id));
        assert!(!registry.disarm(ride_id));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settle_waits_for_background_work() {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            tasks.spawn(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }
}
