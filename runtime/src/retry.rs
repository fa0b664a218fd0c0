//! Bounded retries with exponential backoff for collaborator calls.
//!
//! Routing lookups and directory queries go through here when the provider
//! reports a transient failure. Conditional ride writes never do: a lost
//! predicate is an answer, not a failure.
//!
//! ```rust
//! use ride_dispatch_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let eta = retry_with_predicate(
//!     "eta",
//!     &policy,
//!     || async { Ok::<u32, String>(7) },
//!     |err: &String| err.starts_with("busy"),
//! )
//! .await?;
//! assert_eq!(eta, 7);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to retry and how long to back off in between.
///
/// The wait before retry `n` (zero based) is `initial_delay * multiplier^n`,
/// capped at `max_delay`. Defaults: 3 retries, 100ms, x2, at most 30s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first call
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor between waits
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Start from the defaults and override what differs.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder(Self::default())
    }

    /// Call once, never retry.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (zero based).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )] // bounded by max_delay before the cast back
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = (self.initial_delay.as_nanos() as f64
            * self.multiplier.max(1.0).powi(exponent))
        .round();
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Total time spent waiting if every retry is used.
    #[must_use]
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt)).sum()
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder(RetryPolicy);

impl RetryPolicyBuilder {
    /// Retries after the first call.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.0.max_retries = max_retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.0.initial_delay = delay;
        self
    }

    /// Cap on any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.0.max_delay = delay;
        self
    }

    /// Growth factor between waits; values below 1 are treated as 1.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.0.multiplier = multiplier;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.0
    }
}

/// Retry every error under `policy`.
///
/// # Errors
///
/// The last error once retries run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_predicate(operation_name, policy, operation, |_| true).await
}

/// Retry only the errors `is_retryable` accepts.
///
/// # Errors
///
/// The first error `is_retryable` rejects, or the last error once retries
/// run out.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    RetryMetrics::record_success();
                    tracing::info!(operation = operation_name, retries, "Recovered after retry");
                }
                return Ok(value);
            },
            Err(error) => error,
        };

        if !is_retryable(&error) {
            tracing::debug!(operation = operation_name, error = %error, "Permanent failure");
            return Err(error);
        }
        if retries >= policy.max_retries {
            RetryMetrics::record_exhausted();
            tracing::warn!(operation = operation_name, retries, error = %error, "Retries exhausted");
            return Err(error);
        }

        let delay = policy.delay_for_attempt(retries);
        RetryMetrics::record_attempt();
        tracing::debug!(
            operation = operation_name,
            retry = retries + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Transient failure, backing off"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
