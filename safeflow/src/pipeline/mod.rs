//! Pipeline building and execution.
//!
//! This module provides:
//! - A builder validating stage lists
//! - A sequential executor owning one compensating transaction per run

mod builder;
mod executor;
#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use executor::{PipelineExecutor, RunOutcome, RunStatus};
