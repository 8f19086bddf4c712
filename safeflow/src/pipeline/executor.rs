//! Sequential pipeline executor with compensation on failure.

use crate::compensation::{AuditEntry, CompensatingTransaction, CompensationConfig};
use crate::context::PipelineContext;
use crate::errors::{PipelineError, StageError, StageFailure};
use crate::events::{stamped, EventSink};
use crate::observability::run_span;
use crate::stages::Stage;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every stage ran.
    Completed,
    /// A stage asked to skip the rest.
    ShortCircuited {
        /// Stage that set the sentinel.
        stage: String,
        /// Reason it gave.
        reason: String,
    },
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Run ID from the context.
    pub run_id: Uuid,
    /// How the run ended.
    pub status: RunStatus,
    /// Best-effort stages that failed after commit.
    pub degraded: Vec<StageError>,
    /// Audit trail of the run's transaction.
    pub audit: Vec<AuditEntry>,
}

impl RunOutcome {
    /// Returns true if the run stopped early.
    #[must_use]
    pub const fn is_short_circuited(&self) -> bool {
        matches!(self.status, RunStatus::ShortCircuited { .. })
    }

    /// Returns true if a best-effort stage failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Runs an ordered list of stages over one context per run.
///
/// Each run gets its own [`CompensatingTransaction`]. The executor itself
/// holds no per-run state, so one executor serves concurrent runs.
pub struct PipelineExecutor {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    event_sink: Arc<dyn EventSink>,
    compensation: CompensationConfig,
}

impl PipelineExecutor {
    pub(crate) fn new(
        name: String,
        stages: Vec<Arc<dyn Stage>>,
        event_sink: Arc<dyn EventSink>,
        compensation: CompensationConfig,
    ) -> Self {
        Self {
            name,
            stages,
            event_sink,
            compensation,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Creates the transaction a run would use.
    #[must_use]
    pub fn transaction_for(&self, ctx: &PipelineContext) -> CompensatingTransaction {
        CompensatingTransaction::new(format!("{}:{}", self.name, ctx.run_id()))
            .with_config(self.compensation.clone())
            .with_event_sink(Arc::clone(&self.event_sink))
    }

    /// Runs every stage over `ctx` inside a fresh transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StageFailed`] with the failing stage's
    /// original error after all compensations have run.
    pub async fn run(&self, ctx: &mut PipelineContext) -> Result<RunOutcome, PipelineError> {
        let tx = self.transaction_for(ctx);
        let span = run_span(&self.name, ctx.run_id());
        self.run_in(ctx, &tx).instrument(span).await
    }

    /// Runs every stage over `ctx` inside `tx`.
    ///
    /// Lets the caller inspect the transaction's audit trail after a
    /// failed run.
    ///
    /// # Errors
    ///
    /// See [`PipelineExecutor::run`].
    pub async fn run_in(
        &self,
        ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<RunOutcome, PipelineError> {
        let run_id = ctx.run_id();
        info!(pipeline = %self.name, %run_id, source = %ctx.source_name(), "Pipeline started");
        self.emit(
            "pipeline.started",
            json!({
                "pipeline": self.name,
                "run_id": run_id.to_string(),
                "source_name": ctx.source_name(),
                "stages": self.stage_names(),
            }),
        );

        let mut degraded = Vec::new();

        for stage in &self.stages {
            let result = if ctx.is_expired() {
                Err(StageFailure::DeadlineExceeded {
                    attempts: 0,
                    last_error: None,
                })
            } else {
                debug!(pipeline = %self.name, stage = stage.name(), "Executing stage");
                stage.execute(ctx, tx).await
            };

            match result {
                Ok(()) => {
                    if let Some(reason) = ctx.short_circuit_reason().map(str::to_string) {
                        tx.commit();
                        info!(pipeline = %self.name, stage = stage.name(), %reason, "Pipeline short-circuited");
                        self.emit(
                            "pipeline.short_circuited",
                            json!({
                                "pipeline": self.name,
                                "run_id": run_id.to_string(),
                                "stage": stage.name(),
                                "reason": reason,
                            }),
                        );
                        return Ok(RunOutcome {
                            run_id,
                            status: RunStatus::ShortCircuited {
                                stage: stage.name().to_string(),
                                reason,
                            },
                            degraded,
                            audit: tx.audit_entries(),
                        });
                    }
                }
                Err(failure) if tx.is_committed() && stage.best_effort() => {
                    let err = StageError::new(stage.name(), failure);
                    warn!(pipeline = %self.name, stage = stage.name(), error = %err, "Best-effort stage failed after commit");
                    self.emit(
                        "stage.best_effort_failed",
                        json!({
                            "pipeline": self.name,
                            "run_id": run_id.to_string(),
                            "stage": stage.name(),
                            "error": err.source.to_string(),
                        }),
                    );
                    degraded.push(err);
                }
                Err(failure) => {
                    let err = StageError::new(stage.name(), failure);
                    ctx.set_error(err.to_string());
                    let report = tx.unwind().await;
                    error!(
                        pipeline = %self.name,
                        stage = stage.name(),
                        error = %err,
                        compensated = report.succeeded,
                        compensation_failures = report.failed.len(),
                        "Pipeline failed"
                    );
                    self.emit(
                        "pipeline.failed",
                        json!({
                            "pipeline": self.name,
                            "run_id": run_id.to_string(),
                            "stage": stage.name(),
                            "error": err.source.to_string(),
                            "compensations_attempted": report.attempted,
                            "compensations_failed": report.failed.len(),
                            "orphaned": report.orphaned().map(|f| f.resource_id.clone()).collect::<Vec<_>>(),
                        }),
                    );
                    return Err(err.into());
                }
            }
        }

        tx.commit();
        info!(pipeline = %self.name, %run_id, degraded = degraded.len(), "Pipeline completed");
        self.emit(
            "pipeline.completed",
            json!({
                "pipeline": self.name,
                "run_id": run_id.to_string(),
                "degraded": degraded.iter().map(|e| e.stage.clone()).collect::<Vec<_>>(),
            }),
        );

        Ok(RunOutcome {
            run_id,
            status: RunStatus::Completed,
            degraded,
            audit: tx.audit_entries(),
        })
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.event_sink.try_emit(event_type, Some(stamped(data)));
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}
