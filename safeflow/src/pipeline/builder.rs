//! Pipeline builder with validation.

use super::executor::PipelineExecutor;
use crate::compensation::CompensationConfig;
use crate::errors::PipelineValidationError;
use crate::events::{noop_sink, EventSink};
use crate::stages::Stage;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
#[derive(Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    event_sink: Arc<dyn EventSink>,
    compensation: CompensationConfig,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            event_sink: noop_sink(),
            compensation: CompensationConfig::default(),
        }
    }

    /// Appends a stage. Stages run in the order they are added.
    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the event sink handed to the executor and its transactions.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sets the compensation config for every run.
    #[must_use]
    pub fn compensation_config(mut self, config: CompensationConfig) -> Self {
        self.compensation = config;
        self
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

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages or two stages share a name.
    pub fn build(self) -> Result<PipelineExecutor, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for stage in &self.stages {
            let name = stage.name();
            if !seen.insert(name) && !duplicates.iter().any(|d: &String| d == name) {
                duplicates.push(name.to_string());
            }
        }
        if !duplicates.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage names in pipeline '{}': {}",
                self.name,
                duplicates.join(", ")
            ))
            .with_stages(duplicates));
        }

        Ok(PipelineExecutor::new(
            self.name,
            self.stages,
            self.event_sink,
            self.compensation,
        ))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .field("compensation", &self.compensation)
            .finish_non_exhaustive()
    }
}
