//! Context for pipeline runs.
//!
//! One [`PipelineContext`] per run carries the input, the fields stages
//! write for each other, the short-circuit sentinel and the run deadline.

pub mod keys;
mod run;

pub use run::PipelineContext;
