//! Rollback handlers: one undo action plus the metadata to audit it.

use crate::errors::CompensationError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// What kind of external resource a handler cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A file in the remote blob/file store.
    BlobStore,
    /// An entry in the remote search index.
    SearchIndex,
    /// Anything else.
    Other,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlobStore => write!(f, "blob_store"),
            Self::SearchIndex => write!(f, "search_index"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Identifies a registered handler within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Undo action. Called at most once.
pub type RollbackAction =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CompensationError>> + Send>;

/// One undo action for one externally created resource.
pub struct RollbackHandler {
    pub(crate) action: RollbackAction,
    /// Kind of resource, for audit grouping.
    pub resource_type: ResourceType,
    /// Identifier of the created resource.
    pub resource_id: String,
    /// Free-form description.
    pub description: String,
    /// Whether a failed compensation must be escalated as an alert.
    pub critical: bool,
}

impl RollbackHandler {
    /// Creates a non-critical handler.
    pub fn new<F, Fut>(resource_type: ResourceType, resource_id: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CompensationError>> + Send + 'static,
    {
        let resource_id = resource_id.into();
        Self {
            action: Box::new(move || action().boxed()),
            description: format!("undo {resource_type} {resource_id}"),
            resource_type,
            resource_id,
            critical: false,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks the handler critical.
    #[must_use]
    pub const fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Sets the critical flag.
    #[must_use]
    pub const fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

impl fmt::Debug for RollbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackHandler")
            .field("resource_type", &self.resource_type)
            .field("resource_id", &self.resource_id)
            .field("description", &self.description)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}
