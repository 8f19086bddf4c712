//! Retryable-versus-fatal error classification.

use crate::errors::{ErrorKind, ExternalError, ResilienceError, StageFailure};
use serde::{Deserialize, Serialize};

/// Whether re-attempting an operation has a reasonable chance of succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient condition; retry may succeed.
    Retryable,
    /// Structural condition; retrying repeats the failure.
    Fatal,
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Retryable`].
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Returns true for [`ErrorClass::Fatal`].
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

/// Errors that know their own class.
pub trait Classify {
    /// Classifies this error.
    fn error_class(&self) -> ErrorClass;
}

impl Classify for ErrorKind {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::RateLimited | Self::Connection | Self::Timeout | Self::ServerError => {
                ErrorClass::Retryable
            }
            Self::Unauthorized
            | Self::Forbidden
            | Self::BadRequest
            | Self::NotFound
            | Self::Validation
            | Self::Other => ErrorClass::Fatal,
        }
    }
}

impl Classify for ExternalError {
    fn error_class(&self) -> ErrorClass {
        self.kind.error_class()
    }
}

impl<E: Classify> Classify for ResilienceError<E> {
    fn error_class(&self) -> ErrorClass {
        match self {
            // Retrying into an open breaker gains nothing.
            Self::CircuitOpen { .. } | Self::DeadlineExceeded { .. } => ErrorClass::Fatal,
            Self::Operation(e) => e.error_class(),
        }
    }
}

impl Classify for StageFailure {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::External(e) => e.error_class(),
            Self::CircuitOpen { .. }
            | Self::DeadlineExceeded { .. }
            | Self::MissingField(_)
            | Self::Validation(_)
            | Self::DataConflict(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }
}

/// Maps an error value to retryable or fatal.
///
/// Implemented by [`DefaultClassifier`] for every [`Classify`] error and by
/// any `Fn(&E) -> ErrorClass` closure, so callers can override the mapping
/// per dependency.
pub trait ErrorClassifier<E: ?Sized>: Send + Sync {
    /// Classifies an error.
    fn classify(&self, error: &E) -> ErrorClass;
}

/// Classifier that defers to the error's own [`Classify`] impl.
///
/// Rate limits, connection failures, timeouts and 5xx errors are retryable;
/// everything else, including unrecognised errors, is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl<E: Classify + ?Sized> ErrorClassifier<E> for DefaultClassifier {
    fn classify(&self, error: &E) -> ErrorClass {
        error.error_class()
    }
}

impl<E: ?Sized, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}
