//! Dispatch metrics and their Prometheus exporter.
//!
//! Each component records through a small facade (`StoreMetrics`,
//! `RideMetrics`, `DispatchMetrics`, `RoutingMetrics`, `SessionMetrics`,
//! `RetryMetrics`) so metric names live in this file only. Without an
//! installed recorder every call is a no-op, which is what tests rely on.
//!
//! ```rust,no_run
//! use ride_dispatch_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use metrics::{counter, histogram};

/// The exporter could not be set up
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Invalid exporter configuration or listener address
    #[error("cannot build Prometheus exporter: {0}")]
    Build(String),
}

/// Serves `/metrics` for Prometheus to scrape.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Exporter that will listen on `addr` once started
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric, install the recorder and spawn the listener.
    ///
    /// Needs a Tokio runtime. A second recorder in the same process is
    /// skipped with a warning and leaves this server without a handle.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Build`] when the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Latency buckets for store writes and routing calls
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("A metrics recorder is already installed, exporter not started");
            return Ok(());
        }

        tokio::spawn(async move {
            if let Err(error) = exporter.await {
                tracing::error!(error = ?error, "Metrics HTTP listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Serving /metrics");
        Ok(())
    }

    /// Recorder handle, once started
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in the text exposition format; `None` before start
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Ride store
    describe_counter!(
        "ride_store_conditional_updates_total",
        "Conditional ride updates by outcome (applied, conflict, not_found, error)"
    );
    describe_histogram!(
        "ride_store_update_duration_seconds",
        "Time taken by one conditional ride update"
    );

    // Ride lifecycle
    describe_counter!("rides_created_total", "Ride requests created");
    describe_counter!(
        "rides_accept_total",
        "Acceptance attempts by result (won, lost)"
    );
    describe_counter!(
        "rides_phase_advanced_total",
        "Driver phase advances by target status"
    );
    describe_counter!(
        "rides_cancelled_total",
        "Cancellation attempts by role and whether they changed the ride"
    );
    describe_counter!(
        "rides_timeouts_total",
        "Timer-driven terminal transitions by kind (passenger_wait, no_show)"
    );

    // Dispatch
    describe_counter!(
        "dispatch_notifications_total",
        "Driver offer notifications by result (sent, failed)"
    );
    describe_histogram!(
        "dispatch_fanout_drivers",
        "Number of eligible drivers notified per ride"
    );

    // Routing
    describe_counter!(
        "routing_fallback_total",
        "Routes replaced by a straight line after the provider failed"
    );
    describe_histogram!(
        "routing_request_duration_seconds",
        "Time taken by one routing provider call"
    );

    // Session runtime
    describe_counter!(
        "session_actions_processed_total",
        "Total number of actions processed by session reducers"
    );
    describe_histogram!(
        "session_reducer_duration_seconds",
        "Time taken to execute session reducers"
    );
    describe_counter!(
        "session_effects_executed_total",
        "Effects executed by the session store, by type"
    );
    describe_counter!(
        "session_effects_cancelled_total",
        "Cancellable effects stopped before completion"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Outcome label of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Predicate held, patch written
    Applied,
    /// Predicate failed
    Conflict,
    /// No such ride
    NotFound,
    /// Backend failure
    Error,
}

impl UpdateOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Error => "error",
        }
    }
}

/// Ride store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record one conditional update.
    pub fn record_update(outcome: UpdateOutcome, duration: Duration) {
        counter!("ride_store_conditional_updates_total", "outcome" => outcome.as_str())
            .increment(1);
        histogram!("ride_store_update_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Ride lifecycle metrics recorder.
pub struct RideMetrics;

impl RideMetrics {
    /// Record a ride creation.
    pub fn record_created(category: &str) {
        counter!("rides_created_total", "category" => category.to_string()).increment(1);
    }

    /// Record an acceptance attempt.
    pub fn record_accept(won: bool) {
        let result = if won { "won" } else { "lost" };
        counter!("rides_accept_total", "result" => result).increment(1);
    }

    /// Record a phase advance.
    pub fn record_phase(status: &'static str) {
        counter!("rides_phase_advanced_total", "status" => status).increment(1);
    }

    /// Record a cancellation attempt.
    pub fn record_cancelled(role: &'static str, applied: bool) {
        counter!(
            "rides_cancelled_total",
            "role" => role,
            "applied" => if applied { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record a timer-driven terminal transition.
    pub fn record_timeout(kind: &'static str) {
        counter!("rides_timeouts_total", "kind" => kind).increment(1);
    }
}

/// Dispatch fan-out metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record the size of one fan-out.
    #[allow(clippy::cast_precision_loss)] // driver counts are far below 2^52
    pub fn record_fanout(drivers: usize) {
        histogram!("dispatch_fanout_drivers").record(drivers as f64);
    }

    /// Record one notification result.
    pub fn record_notification(sent: bool) {
        let result = if sent { "sent" } else { "failed" };
        counter!("dispatch_notifications_total", "result" => result).increment(1);
    }
}

/// Routing metrics recorder.
pub struct RoutingMetrics;

impl RoutingMetrics {
    /// Record one provider call.
    pub fn record_request(duration: Duration) {
        histogram!("routing_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a straight-line fallback.
    pub fn record_fallback() {
        counter!("routing_fallback_total").increment(1);
    }
}

/// Session runtime metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record an action processed.
    pub fn record_action(duration: Duration) {
        counter!("session_actions_processed_total").increment(1);
        histogram!("session_reducer_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an effect execution.
    pub fn record_effect(kind: &'static str) {
        counter!("session_effects_executed_total", "type" => kind).increment(1);
    }

    /// Record a cancelled effect.
    pub fn record_cancelled() {
        counter!("session_effects_cancelled_total").increment(1);
    }
}

/// Collaborator retries.
pub struct RetryMetrics;

impl RetryMetrics {
    /// A transient failure is being retried
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// A call succeeded after at least one retry
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// A call gave up with retries exhausted
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
