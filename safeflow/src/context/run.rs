//! Per-run mutable context threaded through every stage.

use crate::errors::{DataConflictError, StageFailure};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// State for one pipeline run.
///
/// Owned by exactly one run and handed to each stage as `&mut`, so there is
/// no locking. Fields are write-once through [`PipelineContext::set`];
/// [`PipelineContext::set_force`] exists for stages that legitimately
/// refine a value.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    run_id: Uuid,
    source_name: String,
    content: Vec<u8>,
    fields: HashMap<String, Value>,
    short_circuit: Option<String>,
    deadline: Option<Instant>,
    error: Option<String>,
}

impl PipelineContext {
    /// Creates a context for one input item.
    #[must_use]
    pub fn new(source_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_name: source_name.into(),
            content: content.into(),
            fields: HashMap::new(),
            short_circuit: None,
            deadline: None,
            error: None,
        }
    }

    /// Sets an absolute deadline for the whole run.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the run ID.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Returns the run ID.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the name of the input item (file name, message ID...).
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Returns the raw input content.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Returns the run deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Gets a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Gets a string field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Gets a string field a stage cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`StageFailure::MissingField`] if absent or not a string.
    pub fn require_str(&self, key: &str) -> Result<&str, StageFailure> {
        self.get_str(key)
            .ok_or_else(|| StageFailure::MissingField(key.to_string()))
    }

    /// Returns true if the field exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Sets a field that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `DataConflictError` if the key already exists.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), DataConflictError> {
        let key = key.into();
        if self.fields.contains_key(&key) {
            return Err(DataConflictError::new(key));
        }
        self.fields.insert(key, value);
        Ok(())
    }

    /// Sets a field, allowing overwrites.
    pub fn set_force(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Returns a copy of all fields.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        self.fields.clone()
    }

    /// Asks the executor to skip the remaining stages and commit.
    ///
    /// This is a success path: nothing is unwound.
    pub fn mark_short_circuit(&mut self, reason: impl Into<String>) {
        self.short_circuit = Some(reason.into());
    }

    /// Returns the short-circuit reason, if set.
    #[must_use]
    pub fn short_circuit_reason(&self) -> Option<&str> {
        self.short_circuit.as_deref()
    }

    /// Returns true if a stage asked to short-circuit.
    #[must_use]
    pub const fn is_short_circuited(&self) -> bool {
        self.short_circuit.is_some()
    }

    /// Records the error that ended the run.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Returns the error that ended the run, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
