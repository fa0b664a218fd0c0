//! # Ride Dispatch
//!
//! Coordination of ride requests between passengers and drivers over one
//! shared store.
//!
//! - [`service::RideService`]: create, fan-out, the acceptance race, trip
//!   phases, cancellation, abandonment timers and recovery
//! - [`observer::RideObserver`]: live snapshots with a polling fallback
//! - [`session`]: driver and passenger clients as reducers
//! - [`routing`], [`fare`], [`notifier`]: production collaborators
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch::{DispatchEnvironment, RideService};
//! use ride_dispatch_testing::{InMemoryCancellationLog, InMemoryRideStore, fixtures};
//!
//! let env = DispatchEnvironment::new(
//!     Arc::new(InMemoryRideStore::new()),
//!     Arc::new(InMemoryCancellationLog::new()),
//! );
//! let service = RideService::new(env);
//!
//! let ride = service.create(fixtures::payload(passenger_id)).await?;
//! let ride = service.accept(driver_id, ride.id).await?;
//! ```

pub mod config;
pub mod environment;
pub mod fare;
pub mod notifier;
pub mod observer;
pub mod optimistic;
pub mod routing;
pub mod service;
pub mod session;

pub use config::Config;
pub use environment::DispatchEnvironment;
pub use observer::{RideObserver, RideWatch};
pub use service::{CancelRequest, RideService};
