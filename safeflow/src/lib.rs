//! # Safeflow
//!
//! Fault tolerance for staged document pipelines that write to several
//! external systems which share no transaction.
//!
//! Safeflow provides:
//!
//! - **Circuit breaking**: one shared breaker per external dependency that
//!   fails fast during outages and admits a single probe to detect recovery
//! - **Bounded retries**: exponential backoff with optional jitter for
//!   transient errors, bounded by attempts and an optional run deadline
//! - **Compensating transactions**: undo actions registered as resources are
//!   created and run in reverse order when a later step fails
//! - **Staged execution**: an ordered pipeline with short-circuiting and a
//!   commit point after which nothing is undone
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use safeflow::prelude::*;
//!
//! let config = SafeflowConfig::default();
//! let breakers = config.breaker_registry();
//!
//! let pipeline = PipelineBuilder::new("documents")
//!     .stage(Arc::new(HashStage::new()))
//!     .stage(Arc::new(DedupeStage::new(records.clone())))
//!     .stage(Arc::new(UploadStage::new(blobs, config.guard(&breakers, "blob_store"))))
//!     .stage(Arc::new(ExtractStage::new(inference, config.guard(&breakers, "inference"))))
//!     .stage(Arc::new(PersistStage::new(records)))
//!     .stage(Arc::new(IndexStage::new(index, config.guard(&breakers, "search_index"))))
//!     .build()?;
//!
//! let mut ctx = PipelineContext::new("invoice.pdf", bytes);
//! let outcome = pipeline.run(&mut ctx).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod compensation;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::compensation::{
        AuditEntry, AuditEvent, CompensatingTransaction, CompensationConfig, ResourceType,
        RollbackHandler, UnwindReport,
    };
    pub use crate::config::SafeflowConfig;
    pub use crate::context::{keys, PipelineContext};
    pub use crate::errors::{
        CompensationError, ErrorKind, ExternalError, PipelineError, PipelineValidationError,
        ResilienceError, StageError, StageFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{PipelineBuilder, PipelineExecutor, RunOutcome, RunStatus};
    pub use crate::resilience::{
        BreakerConfig, BreakerRegistry, CallGuard, CircuitBreaker, CircuitState, Classify,
        ErrorClass, RetryExecutor, RetryPolicy,
    };
    pub use crate::stages::{
        BlobStore, DedupeStage, DuplicateLookup, ExtractStage, FnStage, HashStage, IndexStage,
        InferenceClient, PersistStage, RecordStore, SearchIndex, Stage, UploadStage,
    };
    pub use std::sync::Arc;
}
