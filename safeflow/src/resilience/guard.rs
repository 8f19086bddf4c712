//! Breaker plus retry policy for one outbound dependency.

use super::breaker::CircuitBreaker;
use super::classifier::{DefaultClassifier, ErrorClassifier};
use super::retry::{RetryExecutor, RetryPolicy};
use crate::errors::ResilienceError;
use crate::events::EventSink;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Everything a stage needs to call one dependency safely.
///
/// The breaker is shared (usually obtained from a
/// [`super::BreakerRegistry`]); the executor is owned by the guard.
#[derive(Debug)]
pub struct CallGuard<C = DefaultClassifier> {
    breaker: Arc<CircuitBreaker>,
    executor: RetryExecutor<C>,
}

impl CallGuard<DefaultClassifier> {
    /// Creates a guard for `breaker` with the default classifier.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        let executor = RetryExecutor::new(breaker.name().to_string(), policy);
        Self { breaker, executor }
    }
}

impl<C> CallGuard<C> {
    /// Creates a guard with an explicit classifier.
    #[must_use]
    pub fn with_classifier(breaker: Arc<CircuitBreaker>, policy: RetryPolicy, classifier: C) -> Self {
        let executor = RetryExecutor::with_classifier(breaker.name().to_string(), policy, classifier);
        Self { breaker, executor }
    }

    /// Sets the event sink used for retry events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink);
        self
    }

    /// Returns the protected dependency's name.
    #[must_use]
    pub fn dependency(&self) -> &str {
        self.breaker.name()
    }

    /// Returns the shared breaker.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        self.executor.policy()
    }

    /// Calls `op` with retries, every attempt passing through the breaker.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::execute`].
    pub async fn call<T, E, F, Fut>(
        &self,
        deadline: Option<Instant>,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        C: ErrorClassifier<E>,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.executor.execute(Some(&self.breaker), deadline, op).await
    }
}
