//! `PostgreSQL` backend for ride dispatch.
//!
//! Provides the durable [`RideRequestStore`](ride_dispatch_core::store::RideRequestStore),
//! its change feed, and the cancellation log. Conditional updates compile to a
//! single guarded `UPDATE … RETURNING`, so concurrent writers are serialised by
//! the row lock and exactly one of them matches the predicate.
//!
//! Change notifications are published by a trigger on `ride_requests` via
//! `pg_notify` and consumed through a `LISTEN` connection.
//!
//! # Example
//!
//! ```ignore
//! use ride_dispatch_postgres::{PostgresCancellationLog, PostgresRideStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresRideStore::new("postgres://localhost/rides", 10).await?;
//!     store.migrate().await?;
//!     let log = PostgresCancellationLog::new(store.pool().clone());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancellation_log;
mod ride_store;
mod schema;

pub use cancellation_log::PostgresCancellationLog;
pub use ride_store::PostgresRideStore;
pub use schema::{CHANGE_CHANNEL, migrate};
