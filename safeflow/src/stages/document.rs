//! Document ingestion stages.
//!
//! hash -> dedupe -> upload -> extract -> persist -> index
//!
//! Upload and index create remote resources and register their undo
//! actions. Persist commits the local record and, with it, the run's
//! compensating transaction.

use super::ports::{
    BlobStore, DuplicateLookup, InferenceClient, NewRecord, RecordStore, SearchIndex,
};
use super::Stage;
use crate::compensation::{CompensatingTransaction, ResourceType};
use crate::context::{keys, PipelineContext};
use crate::errors::{CompensationError, StageFailure};
use crate::resilience::CallGuard;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Computes the SHA-256 hex digest of the content.
#[derive(Debug, Default)]
pub struct HashStage;

impl HashStage {
    /// Creates the stage.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for HashStage {
    fn name(&self) -> &str {
        "hash"
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let digest = hex::encode(Sha256::digest(ctx.content()));
        ctx.set(keys::CONTENT_HASH, json!(digest))?;
        Ok(())
    }
}

/// Stops the run when the content was already processed.
pub struct DedupeStage {
    lookup: Arc<dyn DuplicateLookup>,
}

impl DedupeStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(lookup: Arc<dyn DuplicateLookup>) -> Self {
        Self { lookup }
    }
}

impl std::fmt::Debug for DedupeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for DedupeStage {
    fn name(&self) -> &str {
        "dedupe"
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let hash = ctx.require_str(keys::CONTENT_HASH)?.to_string();
        if let Some(existing) = self.lookup.find_by_hash(&hash).await? {
            info!(source = %ctx.source_name(), duplicate_of = %existing, "Duplicate content");
            ctx.set(keys::DUPLICATE_OF, json!(existing))?;
            ctx.mark_short_circuit(format!("duplicate of {existing}"));
        }
        Ok(())
    }
}

/// Uploads the content to the blob store.
///
/// The delete handler is critical: a file left behind after a failed run
/// is an orphan nobody will find.
pub struct UploadStage {
    store: Arc<dyn BlobStore>,
    guard: CallGuard,
}

impl UploadStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, guard: CallGuard) -> Self {
        Self { store, guard }
    }
}

impl std::fmt::Debug for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadStage")
            .field("dependency", &self.guard.dependency())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for UploadStage {
    fn name(&self) -> &str {
        "upload"
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let file_id = {
            let name = ctx.source_name();
            let content = ctx.content();
            self.guard
                .call(ctx.deadline(), || self.store.upload(name, content))
                .await?
        };

        let store = Arc::clone(&self.store);
        let target = file_id.clone();
        tx.register_rollback(
            move || async move { store.delete(&target).await.map_err(CompensationError::from) },
            ResourceType::BlobStore,
            file_id.clone(),
            format!("delete uploaded file for {}", ctx.source_name()),
            true,
        );

        debug!(file_id = %file_id, "Uploaded content");
        ctx.set(keys::REMOTE_FILE_ID, json!(file_id))?;
        Ok(())
    }
}

/// Calls the inference API on the uploaded file.
pub struct ExtractStage {
    client: Arc<dyn InferenceClient>,
    guard: CallGuard,
}

impl ExtractStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(client: Arc<dyn InferenceClient>, guard: CallGuard) -> Self {
        Self { client, guard }
    }
}

impl std::fmt::Debug for ExtractStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractStage")
            .field("dependency", &self.guard.dependency())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &str {
        "extract"
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        _tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let file_id = ctx.require_str(keys::REMOTE_FILE_ID)?.to_string();
        let extracted = self
            .guard
            .call(ctx.deadline(), || self.client.extract(&file_id))
            .await?;

        if !extracted.is_object() {
            return Err(StageFailure::Validation(format!(
                "inference returned {} instead of an object",
                value_kind(&extracted)
            )));
        }

        ctx.set(keys::EXTRACTED, extracted)?;
        Ok(())
    }
}

/// Writes the record to the local store and commits the run.
///
/// The local commit is the point of no return: once it succeeds the
/// compensating transaction is committed too.
pub struct PersistStage {
    store: Arc<dyn RecordStore>,
}

impl PersistStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for PersistStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &str {
        "persist"
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let record = NewRecord {
            source_name: ctx.source_name().to_string(),
            content_hash: ctx.require_str(keys::CONTENT_HASH)?.to_string(),
            remote_file_id: ctx.require_str(keys::REMOTE_FILE_ID)?.to_string(),
            extracted: ctx
                .get(keys::EXTRACTED)
                .cloned()
                .ok_or_else(|| StageFailure::MissingField(keys::EXTRACTED.to_string()))?,
        };

        let mut session = self.store.begin().await?;
        let record_id = match session.insert(record).await {
            Ok(id) => id,
            Err(e) => {
                session.rollback().await;
                return Err(e.into());
            }
        };
        session.commit().await?;
        tx.commit();

        info!(record_id = %record_id, source = %ctx.source_name(), "Record persisted");
        ctx.set(keys::RECORD_ID, json!(record_id))?;
        Ok(())
    }
}

/// Adds the document to the search index.
///
/// Best effort: the index can be rebuilt from the record store, so a
/// failure after commit does not fail the run.
pub struct IndexStage {
    index: Arc<dyn SearchIndex>,
    guard: CallGuard,
}

impl IndexStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(index: Arc<dyn SearchIndex>, guard: CallGuard) -> Self {
        Self { index, guard }
    }
}

impl std::fmt::Debug for IndexStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStage")
            .field("dependency", &self.guard.dependency())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for IndexStage {
    fn name(&self) -> &str {
        "index"
    }

    fn best_effort(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &mut PipelineContext,
        tx: &CompensatingTransaction,
    ) -> Result<(), StageFailure> {
        let hash = ctx.require_str(keys::CONTENT_HASH)?.to_string();
        let key = ctx.get_str(keys::RECORD_ID).map_or_else(|| hash.clone(), str::to_string);
        let document = json!({
            "source_name": ctx.source_name(),
            "content_hash": hash,
            "record_id": ctx.get(keys::RECORD_ID),
            "remote_file_id": ctx.get(keys::REMOTE_FILE_ID),
            "extracted": ctx.get(keys::EXTRACTED),
        });

        let entry_id = self
            .guard
            .call(ctx.deadline(), || self.index.add_entry(&key, &document))
            .await?;

        // Nothing to undo once the local record is durable.
        if !tx.is_committed() {
            let index = Arc::clone(&self.index);
            let target = entry_id.clone();
            tx.register_rollback(
                move || async move {
                    index
                        .remove_entry(&target)
                        .await
                        .map_err(CompensationError::from)
                },
                ResourceType::SearchIndex,
                entry_id.clone(),
                format!("remove index entry {key}"),
                false,
            );
        }

        ctx.set(keys::INDEX_ENTRY_ID, json!(entry_id))?;
        Ok(())
    }
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
