//! Circuit breaker guarding one external dependency.
//!
//! States:
//! - Closed: calls pass through; consecutive transient failures are counted.
//! - Open: calls are rejected without being attempted until the recovery
//!   timeout has elapsed.
//! - HalfOpen: exactly one probe call is in flight; its outcome decides
//!   between Closed and Open. Concurrent callers are rejected meanwhile.
//!
//! State lives behind a `parking_lot::Mutex` that is only held for the
//! bookkeeping, never across the wrapped call.

use super::classifier::{Classify, DefaultClassifier, ErrorClassifier};
use crate::errors::ResilienceError;
use crate::events::{noop_sink, stamped, EventSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Public state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// A single probe call is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker. Zero behaves like one.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe, in milliseconds.
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Creates a breaker config.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms: u64::try_from(recovery_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the recovery timeout.
    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn effective_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Current consecutive failure streak.
    pub consecutive_failures: u32,
    /// When the breaker last opened. Set whenever `state` is Open.
    pub opened_at: Option<Instant>,
    /// Whether a HalfOpen probe is currently in flight.
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

/// What kind of admission a call received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

/// State change worth reporting, computed under the lock and emitted after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Opened { failures: u32 },
    Reopened,
    HalfOpened,
    Closed,
    ProbeAbandoned,
}

/// Circuit breaker for one external dependency.
///
/// Cheap to share: wrap it in an `Arc` and hand the same instance to every
/// worker that calls the dependency (see [`super::BreakerRegistry`]).
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    event_sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Creates a new breaker for the named dependency.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            event_sink: noop_sink(),
        }
    }

    /// Sets the event sink for state transitions.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Returns a consistent view of all breaker fields.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at,
            probe_in_flight: state.probe_in_flight,
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let was = {
            let mut state = self.state.lock();
            let was = state.state;
            state.close();
            was
        };
        if was != CircuitState::Closed {
            self.report(Transition::Closed);
        }
    }

    /// Calls `op` through the breaker using the error's own classification.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] if the call was rejected, or
    /// [`ResilienceError::Operation`] wrapping the operation's error.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(&DefaultClassifier, op).await
    }

    /// Calls `op` through the breaker using an explicit classifier.
    ///
    /// Only errors classified retryable count as breaker failures. A fatal
    /// error means the dependency answered, so it is booked like a success;
    /// the error is still returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] if the call was rejected, or
    /// [`ResilienceError::Operation`] wrapping the operation's error.
    pub async fn call_with<T, E, C, F, Fut>(
        &self,
        classifier: &C,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: permit == Permit::Probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(permit),
            Err(e) if classifier.classify(e).is_retryable() => self.on_failure(permit),
            Err(_) => self.on_success(permit),
        }

        result.map_err(ResilienceError::Operation)
    }

    fn acquire<E>(&self) -> Result<Permit, ResilienceError<E>> {
        let now = Instant::now();
        let (decision, transition) = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => (Ok(Permit::Normal), None),
                CircuitState::Open => {
                    let elapsed = state
                        .opened_at
                        .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                    if elapsed >= self.config.recovery_timeout() {
                        state.state = CircuitState::HalfOpen;
                        state.consecutive_failures = 0;
                        state.probe_in_flight = true;
                        (Ok(Permit::Probe), Some(Transition::HalfOpened))
                    } else {
                        (Err(()), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if state.probe_in_flight {
                        (Err(()), None)
                    } else {
                        state.probe_in_flight = true;
                        (Ok(Permit::Probe), None)
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.report(t);
        }

        decision.map_err(|()| {
            debug!(dependency = %self.name, "Circuit open, rejecting call");
            self.event_sink.try_emit(
                "breaker.rejected",
                Some(stamped(serde_json::json!({ "dependency": self.name }))),
            );
            ResilienceError::CircuitOpen {
                dependency: self.name.clone(),
            }
        })
    }

    fn on_success(&self, permit: Permit) {
        let transition = {
            let mut state = self.state.lock();
            match (permit, state.state) {
                (Permit::Probe, CircuitState::HalfOpen) => {
                    state.close();
                    Some(Transition::Closed)
                }
                (Permit::Normal, CircuitState::Closed) => {
                    state.consecutive_failures = 0;
                    None
                }
                // Admitted before a transition made by another caller; the
                // newer state wins.
                _ => None,
            }
        };
        if let Some(t) = transition {
            self.report(t);
        }
    }

    fn on_failure(&self, permit: Permit) {
        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            match (permit, state.state) {
                (Permit::Probe, CircuitState::HalfOpen) => {
                    state.open(now);
                    Some(Transition::Reopened)
                }
                (Permit::Normal, CircuitState::Closed) => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.effective_threshold() {
                        state.open(now);
                        Some(Transition::Opened {
                            failures: state.consecutive_failures,
                        })
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(t) = transition {
            self.report(t);
        }
    }

    fn abandon_probe(&self) {
        let now = Instant::now();
        let abandoned = {
            let mut state = self.state.lock();
            if state.state == CircuitState::HalfOpen && state.probe_in_flight {
                state.open(now);
                true
            } else {
                false
            }
        };
        if abandoned {
            self.report(Transition::ProbeAbandoned);
        }
    }

    fn report(&self, transition: Transition) {
        let (event_type, payload) = match transition {
            Transition::Opened { failures } => {
                warn!(dependency = %self.name, failures, "Circuit breaker opened");
                (
                    "breaker.opened",
                    serde_json::json!({ "dependency": self.name, "consecutive_failures": failures }),
                )
            }
            Transition::Reopened => {
                warn!(dependency = %self.name, "Probe failed, circuit breaker reopened");
                (
                    "breaker.opened",
                    serde_json::json!({ "dependency": self.name, "from": "half_open" }),
                )
            }
            Transition::HalfOpened => {
                info!(dependency = %self.name, "Circuit breaker half-open, probing");
                ("breaker.half_open", serde_json::json!({ "dependency": self.name }))
            }
            Transition::Closed => {
                info!(dependency = %self.name, "Circuit breaker closed");
                ("breaker.closed", serde_json::json!({ "dependency": self.name }))
            }
            Transition::ProbeAbandoned => {
                warn!(dependency = %self.name, "Probe cancelled, circuit breaker reopened");
                (
                    "breaker.opened",
                    serde_json::json!({ "dependency": self.name, "from": "abandoned_probe" }),
                )
            }
        };
        self.event_sink.try_emit(event_type, Some(stamped(payload)));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Releases the probe slot if the probing future is dropped mid-call.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}
