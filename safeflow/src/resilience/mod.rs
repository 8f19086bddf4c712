//! Protection for calls to external dependencies.
//!
//! This module provides:
//! - Error classification (retryable vs fatal)
//! - A per-dependency circuit breaker and a registry sharing them
//! - Bounded exponential backoff with an optional total deadline
//! - [`CallGuard`], the breaker + policy pair a stage holds per dependency

pub mod breaker;
pub mod classifier;
mod guard;
mod registry;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classifier::{Classify, DefaultClassifier, ErrorClass, ErrorClassifier};
pub use guard::CallGuard;
pub use registry::BreakerRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
