//! Testing utilities for safeflow pipelines.
//!
//! This module provides:
//! - In-memory fakes of every collaborator port, with failure injection
//! - Scripted stages for exercising the executor

mod fakes;
mod stages;

pub use fakes::{InMemoryBlobStore, InMemoryRecordStore, InMemorySearchIndex, ScriptedInference};
pub use stages::{CommitStage, FailingStage, RecordingStage, ShortCircuitStage, StageLog};
