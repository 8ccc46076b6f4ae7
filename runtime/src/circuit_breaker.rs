//! Circuit breaker for payment gateway calls.
//!
//! After `failure_threshold` consecutive counted failures the breaker opens and
//! rejects calls for `open_duration`. The next call after that is a trial
//! (half-open); `success_threshold` trial successes close the breaker, one
//! trial failure opens it again.
//!
//! Callers decide which failures count: a declined payment is a healthy
//! gateway, a timeout is not.
//!
//! # Example
//!
//! ```rust
//! use checkout_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "zarinpal",
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(3)
//!         .open_duration(Duration::from_secs(30))
//!         .build(),
//! );
//!
//! let result = breaker
//!     .call(|| async { Ok::<_, String>("authority") }, |_err: &String| true)
//!     .await;
//! assert!(matches!(result, Ok("authority")));
//! # }
//! ```

use metrics::counter;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open.
    pub open_duration: Duration,
    /// Trial successes that close the breaker again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Builder starting from the defaults.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Consecutive counted failures that open the breaker.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// How long the breaker stays open.
    #[must_use]
    pub const fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    /// Trial successes that close the breaker again.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the open period ends.
    Open,
    /// Trial calls decide whether to close.
    HalfOpen,
}

impl State {
    const fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Result of a call through the breaker.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// The breaker is open; the call was not made.
    #[error("circuit is open")]
    Open,
    /// The call was made and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    trial_successes: u32,
    opened_at: Option<Instant>,
}

/// Shared breaker; clones observe the same state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    /// Breaker reporting metrics under `name`.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                opened_at: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, moving from open to half-open if the open period ended.
    #[must_use]
    pub fn state(&self) -> State {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == State::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_duration)
        {
            self.transition(inner, State::HalfOpen);
            inner.trial_successes = 0;
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        if inner.state != to {
            tracing::info!(
                breaker = %self.name,
                from = inner.state.label(),
                to = to.label(),
                "Circuit breaker state change"
            );
            counter!(
                "gateway_circuit_transitions_total",
                "breaker" => self.name.to_string(),
                "to" => to.label()
            )
            .increment(1);
            inner.state = to;
        }
    }

    /// Runs `operation` unless the breaker is open.
    ///
    /// `counts_as_failure` decides whether an error trips the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Open`] without calling `operation` while open,
    /// otherwise the operation's error wrapped in [`CircuitError::Inner`].
    pub async fn call<F, Fut, T, E, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        if self.state() == State::Open {
            counter!("gateway_circuit_rejections_total", "breaker" => self.name.to_string())
                .increment(1);
            return Err(CircuitError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(CircuitError::Inner(error))
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => inner.consecutive_failures = 0,
            State::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold {
                    self.transition(&mut inner, State::Closed);
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            State::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            State::HalfOpen => true,
            State::Open => false,
        };
        if trip {
            self.transition(&mut inner, State::Open);
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, State::Closed);
        inner.consecutive_failures = 0;
        inner.trial_successes = 0;
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_for: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .open_duration(open_for)
                .build(),
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async { Err::<(), _>("timeout") }, |_| true).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = breaker(Duration::from_secs(60));

        let _ = fail(&b).await;
        assert_eq!(b.state(), State::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), State::Open);

        let rejected = b.call(|| async { Ok::<_, &str>(1) }, |_| true).await;
        assert_eq!(rejected, Err(CircuitError::Open));
    }

    #[tokio::test]
    async fn uncounted_errors_do_not_trip() {
        let b = breaker(Duration::from_secs(60));

        for _ in 0..5 {
            let _ = b
                .call(|| async { Err::<(), _>("declined") }, |_| false)
                .await;
        }

        assert_eq!(b.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_closes_on_success() {
        let b = breaker(Duration::from_millis(10));
        let _ = fail(&b).await;
        let _ = fail(&b).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.state(), State::HalfOpen);

        let result = b.call(|| async { Ok::<_, &str>(1) }, |_| true).await;
        assert_eq!(result, Ok(1));
        assert_eq!(b.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens() {
        let b = breaker(Duration::from_millis(10));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = fail(&b).await;

        assert_eq!(b.state(), State::Open);
    }
}
