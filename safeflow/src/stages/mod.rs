//! Stage trait and implementations.
//!
//! A stage is one unit of work in a pipeline run. It reads and writes the
//! run's [`PipelineContext`] and registers undo actions with the run's
//! [`CompensatingTransaction`] for every external resource it creates.

mod document;
pub mod ports;

pub use document::{DedupeStage, ExtractStage, HashStage, IndexStage, PersistStage, UploadStage};
pub use ports::{
    BlobStore, DuplicateLookup, InferenceClient, NewRecord, RecordSession, RecordStore,
    SearchIndex,
};

use crate::compensation::CompensatingTransaction;
use crate::context::PipelineContext;
use crate::errors::StageFailure;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage. Unique within a pipeline.
    fn name(&self) -> &str;

    /// Whether a failure after the transaction committed may be tolerated.
    ///
    /// Best-effort stages that fail after commit are logged and the run
    /// still completes.
    fn best_effort(&self) -> bool {
        false
    }

    /// Executes the stage.
    ///
    /// To end the run early without failing, call
    /// [`PipelineContext::mark_short_circuit`] and return `Ok(())`.
    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure>;
}

/// A stage backed by a synchronous function.
///
/// Useful for pure computations that create no external resources.
pub struct FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), StageFailure> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), StageFailure> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), StageFailure> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), StageFailure> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        (self.func)(ctx)
    }
}
