//! Live ride snapshots over the push change feed, with a polling fallback.
//!
//! A notice is only a hint: every one triggers a fresh read, and whatever
//! comes back is delivered only if its `version` is newer than the last
//! snapshot delivered. Duplicated, reordered or dropped notices therefore
//! cannot make a watcher go backwards.
//!
//! ```text
//!  subscribe ok ──► Push ──(stream ends / read fails)──► Poll
//!       ▲                                                  │
//!       └───────────────(poll window elapsed)──────────────┘
//! ```

use crate::config::ObserverConfig;
use futures::{Stream, StreamExt, stream};
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::{ChangeFeed, ChangeNotice, ChangeStream, RideRequestStore, RideStoreError};
use ride_dispatch_core::types::RideId;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Stream of ever-newer snapshots of one ride
pub type RideWatch = Pin<Box<dyn Stream<Item = RideRequest> + Send>>;

/// Source of [`RideWatch`] streams.
#[derive(Clone)]
pub struct RideObserver {
    store: Arc<dyn RideRequestStore>,
    feed: Arc<dyn ChangeFeed>,
    config: ObserverConfig,
}

impl RideObserver {
    /// Observer reading from `store` and woken by `feed`
    #[must_use]
    pub fn new(store: Arc<dyn RideRequestStore>, feed: Arc<dyn ChangeFeed>, config: ObserverConfig) -> Self {
        Self { store, feed, config }
    }

    /// Watch `ride_id`.
    ///
    /// The first item is the current snapshot. The stream ends right after
    /// delivering a terminal snapshot, or if the ride does not exist.
    #[must_use]
    pub fn watch(&self, ride_id: RideId) -> RideWatch {
        let watcher = Watcher {
            store: Arc::clone(&self.store),
            feed: Arc::clone(&self.feed),
            config: self.config,
            ride_id,
            last_version: None,
            mode: Mode::Start,
        };
        stream::unfold(watcher, Watcher::next).boxed()
    }
}

impl std::fmt::Debug for RideObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RideObserver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Mode {
    Start,
    Push(ChangeStream),
    Poll { resubscribe_at: Instant },
    Done,
}

enum Fetched {
    Fresh(RideRequest),
    Stale,
    Failed,
    Gone,
}

struct Watcher {
    store: Arc<dyn RideRequestStore>,
    feed: Arc<dyn ChangeFeed>,
    config: ObserverConfig,
    ride_id: RideId,
    last_version: Option<u64>,
    mode: Mode,
}

impl Watcher {
    async fn next(mut self) -> Option<(RideRequest, Self)> {
        loop {
            match std::mem::replace(&mut self.mode, Mode::Done) {
                Mode::Done => return None,

                Mode::Start => {
                    // Subscribe before the first read so no write slips between them
                    self.mode = self.connect().await;
                    if let Some(ride) = self.deliver().await {
                        return Some((ride, self));
                    }
                },

                Mode::Push(mut notices) => match notices.next().await {
                    Some(ChangeNotice::Changed(change)) => {
                        self.mode = Mode::Push(notices);
                        if change.ride_id != self.ride_id
                            || self.last_version.is_some_and(|last| change.version <= last)
                        {
                            continue;
                        }
                        if let Some(ride) = self.deliver().await {
                            return Some((ride, self));
                        }
                    },
                    Some(ChangeNotice::Lagged(skipped)) => {
                        tracing::debug!(ride_id = %self.ride_id, skipped, "Change feed lagged, re-reading");
                        self.mode = Mode::Push(notices);
                        if let Some(ride) = self.deliver().await {
                            return Some((ride, self));
                        }
                    },
                    None => {
                        tracing::info!(ride_id = %self.ride_id, "Change feed ended, polling");
                        self.mode = self.polling();
                    },
                },

                Mode::Poll { resubscribe_at } => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    self.mode = if Instant::now() >= resubscribe_at {
                        self.connect().await
                    } else {
                        Mode::Poll { resubscribe_at }
                    };
                    if let Some(ride) = self.deliver().await {
                        return Some((ride, self));
                    }
                },
            }
        }
    }

    fn connect(&self) -> impl std::future::Future<Output = Mode> + Send + 'static {
        connect_feed(Arc::clone(&self.feed), self.ride_id, self.config.poll_window)
    }

    fn polling(&self) -> Mode {
        polling(self.config.poll_window)
    }

    /// Read the ride and return it if it is newer than the last delivery.
    async fn deliver(&mut self) -> Option<RideRequest> {
        match self.fetch().await {
            Fetched::Fresh(ride) => {
                if ride.status.is_terminal() {
                    self.mode = Mode::Done;
                }
                Some(ride)
            },
            Fetched::Stale => None,
            Fetched::Failed => {
                if matches!(self.mode, Mode::Push(_)) {
                    self.mode = self.polling();
                }
                None
            },
            Fetched::Gone => {
                self.mode = Mode::Done;
                None
            },
        }
    }

    async fn fetch(&mut self) -> Fetched {
        match self.store.get(self.ride_id).await {
            Ok(ride) => {
                if self.last_version.is_some_and(|last| ride.version <= last) {
                    return Fetched::Stale;
                }
                self.last_version = Some(ride.version);
                Fetched::Fresh(ride)
            },
            Err(RideStoreError::NotFound(_)) => {
                tracing::debug!(ride_id = %self.ride_id, "Watched ride does not exist");
                Fetched::Gone
            },
            Err(error) => {
                tracing::warn!(ride_id = %self.ride_id, error = %error, "Ride read failed");
                Fetched::Failed
            },
        }
    }
}

async fn connect_feed(feed: Arc<dyn ChangeFeed>, ride_id: RideId, poll_window: Duration) -> Mode {
    match feed.subscribe().await {
        Ok(notices) => Mode::Push(notices),
        Err(error) => {
            tracing::warn!(ride_id = %ride_id, error = %error, "Change feed unavailable, polling");
            polling(poll_window)
        },
    }
}

fn polling(poll_window: Duration) -> Mode {
    Mode::Poll {
        resubscribe_at: Instant::now() + poll_window,
    }
}
