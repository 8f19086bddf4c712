//! Scripted stages for pipeline tests.

use crate::compensation::{CompensatingTransaction, ResourceType};
use crate::context::PipelineContext;
use crate::errors::{ExternalError, StageFailure};
use crate::stages::Stage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared, ordered log of what stages and their rollbacks did.
pub type StageLog = Arc<Mutex<Vec<String>>>;

/// Logs `run:<name>` and, if asked, registers a rollback logging `undo:<name>`.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    log: StageLog,
    with_rollback: bool,
}

impl RecordingStage {
    /// Creates a stage that only records its execution.
    #[must_use]
    pub fn new(name: impl Into<String>, log: StageLog) -> Self {
        Self {
            name: name.into(),
            log,
            with_rollback: false,
        }
    }

    /// Also registers a rollback handler when executed.
    #[must_use]
    pub const fn with_rollback(mut self) -> Self {
        self.with_rollback = true;
        self
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        self.log.lock().push(format!("run:{}", self.name));
        if self.with_rollback {
            let log = Arc::clone(&self.log);
            let label = format!("undo:{}", self.name);
            tx.register_rollback(
                move || async move {
                    log.lock().push(label);
                    Ok(())
                },
                ResourceType::Other,
                self.name.clone(),
                format!("undo {}", self.name),
                false,
            );
        }
        Ok(())
    }
}

/// Always fails with the configured error.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: ExternalError,
    best_effort: bool,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a failing stage.
    #[must_use]
    pub fn new(name: impl Into<String>, error: ExternalError) -> Self {
        Self {
            name: name.into(),
            error,
            best_effort: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Marks the stage best effort.
    #[must_use]
    pub const fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn best_effort(&self) -> bool {
        self.best_effort
    }

    async fn execute(
        &self,
        _ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StageFailure::External(self.error.clone()))
    }
}

/// Marks the context short-circuited.
#[derive(Debug)]
pub struct ShortCircuitStage {
    name: String,
    reason: String,
}

impl ShortCircuitStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Stage for ShortCircuitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        ctx.mark_short_circuit(self.reason.clone());
        Ok(())
    }
}

/// Commits the transaction, standing in for a local durable write.
#[derive(Debug)]
pub struct CommitStage {
    name: String,
}

impl CommitStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for CommitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        tx.commit();
        Ok(())
    }
}
