//! Bounded exponential backoff for transient failures.
//!
//! [`RetryExecutor`] re-attempts an operation while its error is classified
//! retryable, optionally routing every attempt through a [`CircuitBreaker`]
//! and bounding the whole sequence by a caller deadline.

use super::breaker::{CircuitBreaker, CircuitState};
use super::classifier::{DefaultClassifier, ErrorClassifier};
use crate::errors::ResilienceError;
use crate::events::{noop_sink, stamped, EventSink};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry configuration. Stateless; share one instance across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. Values below 1 behave like 1.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add random jitter in `[0, delay)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the effective attempt budget.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed), without jitter.
    ///
    /// `min(max_delay, base_delay * 2^(attempt - 1))`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay after failed attempt `attempt`, with jitter applied if enabled.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..millis))
    }
}

/// Runs operations under a [`RetryPolicy`].
pub struct RetryExecutor<C = DefaultClassifier> {
    name: String,
    policy: RetryPolicy,
    classifier: C,
    event_sink: Arc<dyn EventSink>,
}

impl RetryExecutor<DefaultClassifier> {
    /// Creates an executor using the default classifier.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self::with_classifier(name, policy, DefaultClassifier)
    }
}

impl<C> RetryExecutor<C> {
    /// Creates an executor with an explicit classifier.
    #[must_use]
    pub fn with_classifier(name: impl Into<String>, policy: RetryPolicy, classifier: C) -> Self {
        Self {
            name: name.into(),
            policy,
            classifier,
            event_sink: noop_sink(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the classifier.
    #[must_use]
    pub const fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Executes `op` with retries.
    ///
    /// Each attempt goes through `breaker` when one is supplied. A fatal
    /// error or the last attempt's failure is returned immediately, as is
    /// a failure that left the breaker open. When `deadline` is set it bounds the total time across
    /// all attempts and sleeps; an attempt still running at the deadline is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the last [`ResilienceError`] observed.
    pub async fn execute<T, E, F, Fut>(
        &self,
        breaker: Option<&CircuitBreaker>,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        C: ErrorClassifier<E>,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;
        let mut last_error: Option<String> = None;

        loop {
            attempt += 1;

            let call = async {
                match breaker {
                    Some(b) => b.call_with(&self.classifier, || op()).await,
                    None => op().await.map_err(ResilienceError::Operation),
                }
            };

            let result = match deadline {
                Some(at) => match tokio::time::timeout_at(at, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(self.deadline_exceeded(attempt, last_error));
                    }
                },
                None => call.await,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let op_err = match err {
                ResilienceError::Operation(e) => e,
                // Open breaker or deadline: retrying gains nothing.
                other => return Err(other),
            };

            if self.classifier.classify(&op_err).is_fatal() {
                debug!(operation = %self.name, attempt, error = %op_err, "Fatal error, not retrying");
                return Err(ResilienceError::Operation(op_err));
            }

            if attempt >= max_attempts {
                warn!(operation = %self.name, attempts = attempt, error = %op_err, "Retries exhausted");
                self.event_sink.try_emit(
                    "retry.exhausted",
                    Some(stamped(serde_json::json!({
                        "operation": self.name,
                        "attempts": attempt,
                        "error": op_err.to_string(),
                    }))),
                );
                return Err(ResilienceError::Operation(op_err));
            }

            if breaker.is_some_and(|b| b.state() == CircuitState::Open) {
                debug!(operation = %self.name, attempt, error = %op_err, "Breaker opened, not retrying");
                return Err(ResilienceError::Operation(op_err));
            }

            let delay = self.policy.delay_for(attempt);
            last_error = Some(op_err.to_string());

            if let Some(at) = deadline {
                if Instant::now() + delay >= at {
                    return Err(self.deadline_exceeded(attempt, last_error));
                }
            }

            debug!(
                operation = %self.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %op_err,
                "Retrying after error"
            );
            self.event_sink.try_emit(
                "retry.scheduled",
                Some(stamped(serde_json::json!({
                    "operation": self.name,
                    "attempt": attempt,
                    "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                }))),
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn deadline_exceeded<E>(&self, attempts: u32, last_error: Option<String>) -> ResilienceError<E> {
        warn!(operation = %self.name, attempts, "Deadline exceeded");
        self.event_sink.try_emit(
            "retry.deadline_exceeded",
            Some(stamped(serde_json::json!({
                "operation": self.name,
                "attempts": attempts,
            }))),
        );
        ResilienceError::DeadlineExceeded {
            attempts,
            last_error,
        }
    }
}

impl<C> std::fmt::Debug for RetryExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
