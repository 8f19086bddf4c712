//! Ports - the external collaborators the document stages talk to.
//!
//! Every port reports failures as [`ExternalError`] so the resilience
//! layer can classify them. Stages only receive the ports they need.

use crate::errors::ExternalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

/// Remote blob/file store holding the uploaded originals.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `content` and returns the store-assigned file ID.
    async fn upload(&self, name: &str, content: &[u8]) -> Result<String, ExternalError>;

    /// Deletes a previously uploaded file.
    async fn delete(&self, file_id: &str) -> Result<(), ExternalError>;
}

/// Remote search index.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Adds a document under `key` and returns the entry ID.
    async fn add_entry(&self, key: &str, document: &Value) -> Result<String, ExternalError>;

    /// Removes an entry.
    async fn remove_entry(&self, entry_id: &str) -> Result<(), ExternalError>;
}

/// Remote inference API turning an uploaded file into structured data.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Extracts structured fields from an uploaded file.
    async fn extract(&self, file_id: &str) -> Result<Value, ExternalError>;
}

/// Lookup of already processed content by hash.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DuplicateLookup: Send + Sync {
    /// Returns the record ID of an earlier item with this content hash.
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<String>, ExternalError>;
}

/// Row written by the persist stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Name of the input item.
    pub source_name: String,
    /// SHA-256 hex digest of the content.
    pub content_hash: String,
    /// Blob store file ID.
    pub remote_file_id: String,
    /// Extracted data.
    pub extracted: Value,
}

/// Local durable store with its own commit/rollback.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Opens a session. Nothing is visible until the session commits.
    async fn begin(&self) -> Result<Box<dyn RecordSession>, ExternalError>;
}

/// One local transaction.
#[async_trait]
pub trait RecordSession: Send {
    /// Inserts a record and returns its ID.
    async fn insert(&mut self, record: NewRecord) -> Result<String, ExternalError>;

    /// Makes the inserted records durable.
    async fn commit(self: Box<Self>) -> Result<(), ExternalError>;

    /// Discards the inserted records.
    async fn rollback(self: Box<Self>);
}
