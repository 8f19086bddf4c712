//! Error types for the safeflow framework.
//!
//! The taxonomy separates four concerns:
//!
//! - [`ExternalError`]: what a collaborator (blob store, search index,
//!   inference API, record store) reports when a call fails.
//! - [`ResilienceError`]: an operation error plus the two synthetic errors the
//!   resilience layer produces itself (circuit open, deadline exceeded).
//! - [`StageError`] / [`PipelineError`]: what a pipeline run surfaces.
//! - [`CompensationError`]: a rollback action failing. These never reach the
//!   pipeline caller; they are recorded in the audit log.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Kind of failure reported by an external collaborator.
///
/// The set is closed on purpose: classification in
/// [`crate::resilience::classifier`] matches on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The dependency asked us to slow down (429-equivalent).
    RateLimited,
    /// Connection refused, reset, or DNS failure.
    Connection,
    /// The call did not complete in time.
    Timeout,
    /// Server-side failure (5xx-equivalent).
    ServerError,
    /// Missing or invalid credentials (401-equivalent).
    Unauthorized,
    /// Credentials valid but not allowed (403-equivalent).
    Forbidden,
    /// Malformed request (4xx-equivalent other than rate limiting).
    BadRequest,
    /// The referenced resource does not exist (404-equivalent).
    NotFound,
    /// Application-level validation rejected the payload.
    Validation,
    /// Anything the collaborator could not put into a better bucket.
    Other,
}

impl ErrorKind {
    /// Maps an HTTP-like status code onto an error kind.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            408 => Self::Timeout,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::Validation,
            400..=499 => Self::BadRequest,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error returned by every collaborator port.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExternalError {
    /// Failure kind, used for classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Status code reported by the dependency, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ExternalError {
    /// Creates a new external error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Creates an error from a status code.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Creates a server error.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Creates a malformed-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
}

/// Error produced by the resilience layer around an operation error `E`.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call without attempting it.
    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen {
        /// The protected dependency.
        dependency: String,
    },

    /// The caller's deadline expired before the operation succeeded.
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Message of the last operation error, if an attempt failed.
        last_error: Option<String>,
    },

    /// The operation itself failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Returns true if the call was rejected by an open breaker.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns true if the deadline expired.
    #[must_use]
    pub const fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Returns the wrapped operation error, if any.
    #[must_use]
    pub const fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the error, returning the operation error if any.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// A collaborator call failed.
    #[error(transparent)]
    External(#[from] ExternalError),

    /// A dependency's breaker is open.
    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen {
        /// The protected dependency.
        dependency: String,
    },

    /// The run's deadline expired during retries.
    #[error("deadline exceeded after {attempts} attempt(s){}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    DeadlineExceeded {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Message of the last operation error.
        last_error: Option<String>,
    },

    /// A context field the stage needs is absent.
    #[error("missing context field '{0}'")]
    MissingField(String),

    /// The stage rejected its input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A context field was written twice.
    #[error(transparent)]
    DataConflict(#[from] DataConflictError),

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl<E> From<ResilienceError<E>> for StageFailure
where
    E: Into<Self>,
{
    fn from(err: ResilienceError<E>) -> Self {
        match err {
            ResilienceError::CircuitOpen { dependency } => Self::CircuitOpen { dependency },
            ResilienceError::DeadlineExceeded {
                attempts,
                last_error,
            } => Self::DeadlineExceeded {
                attempts,
                last_error,
            },
            ResilienceError::Operation(e) => e.into(),
        }
    }
}

/// A stage failure tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed: {source}")]
pub struct StageError {
    /// Name of the failing stage.
    pub stage: String,
    /// Underlying cause.
    #[source]
    pub source: StageFailure,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, source: StageFailure) -> Self {
        Self {
            stage: stage.into(),
            source,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("error".to_string(), serde_json::json!(self.source.to_string()));
        map
    }
}

/// The main error type for pipeline runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage failed; compensations have already been unwound.
    #[error(transparent)]
    StageFailed(#[from] StageError),

    /// The pipeline definition is invalid.
    #[error(transparent)]
    Validation(#[from] PipelineValidationError),
}

impl PipelineError {
    /// Returns the stage error, if this is a stage failure.
    #[must_use]
    pub const fn stage_error(&self) -> Option<&StageError> {
        match self {
            Self::StageFailed(e) => Some(e),
            Self::Validation(_) => None,
        }
    }
}

/// Error raised by a rollback action.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompensationError {
    /// What went wrong.
    pub message: String,
}

impl CompensationError {
    /// Creates a new compensation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ExternalError> for CompensationError {
    fn from(err: ExternalError) -> Self {
        Self::new(err.to_string())
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stages".to_string(), serde_json::json!(self.stages));
        map
    }
}

/// Error raised when writing to an existing context field.
#[derive(Debug, Clone, Error)]
#[error("Data conflict: key '{key}' already exists")]
pub struct DataConflictError {
    /// The conflicting key.
    pub key: String,
}

impl DataConflictError {
    /// Creates a new data conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}
