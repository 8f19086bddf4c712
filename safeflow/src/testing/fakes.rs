//! In-memory fakes of the collaborator ports.
//!
//! Each fake can be told to fail: queued errors are returned by the next
//! calls, an outage fails every call until cleared.

use crate::errors::ExternalError;
use crate::stages::ports::{
    BlobStore, DuplicateLookup, InferenceClient, NewRecord, RecordSession, RecordStore,
    SearchIndex,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Failure injection shared by the fakes.
#[derive(Debug, Default)]
struct Faults {
    queued: Mutex<VecDeque<ExternalError>>,
    outage: Mutex<Option<ExternalError>>,
}

impl Faults {
    fn next(&self) -> Result<(), ExternalError> {
        if let Some(err) = self.outage.lock().clone() {
            return Err(err);
        }
        self.queued.lock().pop_front().map_or(Ok(()), Err)
    }

    fn queue(&self, errors: impl IntoIterator<Item = ExternalError>) {
        self.queued.lock().extend(errors);
    }

    fn set_outage(&self, error: Option<ExternalError>) {
        *self.outage.lock() = error;
    }
}

/// Blob store keeping files in a map.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    upload_calls: AtomicU32,
    deleted: Mutex<Vec<String>>,
    upload_faults: Faults,
    delete_faults: Faults,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next uploads fail with these errors, in order.
    pub fn fail_uploads(&self, errors: impl IntoIterator<Item = ExternalError>) {
        self.upload_faults.queue(errors);
    }

    /// Every upload fails with `error` until cleared with `None`.
    pub fn set_upload_outage(&self, error: Option<ExternalError>) {
        self.upload_faults.set_outage(error);
    }

    /// The next deletes fail with these errors, in order.
    pub fn fail_deletes(&self, errors: impl IntoIterator<Item = ExternalError>) {
        self.delete_faults.queue(errors);
    }

    /// Returns true if the file exists.
    #[must_use]
    pub fn contains(&self, file_id: &str) -> bool {
        self.files.lock().contains_key(file_id)
    }

    /// Returns the number of stored files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    /// Returns true if no files are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    /// Returns how many times upload was invoked, failures included.
    #[must_use]
    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Returns the IDs of deleted files, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, _name: &str, content: &[u8]) -> Result<String, ExternalError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.upload_faults.next()?;
        let id = format!("file-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.files.lock().insert(id.clone(), content.to_vec());
        Ok(id)
    }

    async fn delete(&self, file_id: &str) -> Result<(), ExternalError> {
        self.delete_faults.next()?;
        if self.files.lock().remove(file_id).is_none() {
            return Err(ExternalError::from_status(404, format!("no file {file_id}")));
        }
        self.deleted.lock().push(file_id.to_string());
        Ok(())
    }
}

/// Search index keeping entries in a map.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    entries: Mutex<HashMap<String, (String, Value)>>,
    next_id: AtomicU64,
    removed: Mutex<Vec<String>>,
    add_faults: Faults,
}

impl InMemorySearchIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next adds fail with these errors, in order.
    pub fn fail_adds(&self, errors: impl IntoIterator<Item = ExternalError>) {
        self.add_faults.queue(errors);
    }

    /// Every add fails with `error` until cleared with `None`.
    pub fn set_add_outage(&self, error: Option<ExternalError>) {
        self.add_faults.set_outage(error);
    }

    /// Returns true if the entry exists.
    #[must_use]
    pub fn contains(&self, entry_id: &str) -> bool {
        self.entries.lock().contains_key(entry_id)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the IDs of removed entries, in order.
    #[must_use]
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn add_entry(&self, key: &str, document: &Value) -> Result<String, ExternalError> {
        self.add_faults.next()?;
        let id = format!("entry-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.entries
            .lock()
            .insert(id.clone(), (key.to_string(), document.clone()));
        Ok(id)
    }

    async fn remove_entry(&self, entry_id: &str) -> Result<(), ExternalError> {
        if self.entries.lock().remove(entry_id).is_none() {
            return Err(ExternalError::from_status(404, format!("no entry {entry_id}")));
        }
        self.removed.lock().push(entry_id.to_string());
        Ok(())
    }
}

/// Inference client replaying scripted responses.
#[derive(Debug)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<Result<Value, ExternalError>>>,
    fallback: Value,
    calls: AtomicU32,
    faults: Faults,
}

impl ScriptedInference {
    /// Creates a client answering `fallback` once the script runs out.
    #[must_use]
    pub fn new(fallback: Value) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            faults: Faults::default(),
        }
    }

    /// Appends a response to the script.
    #[must_use]
    pub fn then(self, response: Result<Value, ExternalError>) -> Self {
        self.script.lock().push_back(response);
        self
    }

    /// Every call fails with `error` until cleared with `None`.
    pub fn set_outage(&self, error: Option<ExternalError>) {
        self.faults.set_outage(error);
    }

    /// Returns how many times extract was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn extract(&self, _file_id: &str) -> Result<Value, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.faults.next()?;
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

#[derive(Debug, Default)]
struct RecordTable {
    committed: Mutex<Vec<(String, NewRecord)>>,
    next_id: AtomicU64,
    fail_commit: bool,
}

/// Record store with session semantics: inserts are invisible until commit.
///
/// Also answers duplicate lookups against committed records.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordStore {
    table: Arc<RecordTable>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every session commit fail.
    #[must_use]
    pub fn with_failing_commit(self) -> Self {
        Self {
            table: Arc::new(RecordTable {
                fail_commit: true,
                ..RecordTable::default()
            }),
        }
    }

    /// Seeds a committed record, as if an earlier run stored it.
    #[must_use]
    pub fn with_existing(self, record_id: impl Into<String>, content_hash: impl Into<String>) -> Self {
        self.table.committed.lock().push((
            record_id.into(),
            NewRecord {
                source_name: String::new(),
                content_hash: content_hash.into(),
                remote_file_id: String::new(),
                extracted: Value::Null,
            },
        ));
        self
    }

    /// Returns committed records with their IDs.
    #[must_use]
    pub fn committed(&self) -> Vec<(String, NewRecord)> {
        self.table.committed.lock().clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordSession>, ExternalError> {
        Ok(Box::new(InMemorySession {
            table: Arc::clone(&self.table),
            pending: Vec::new(),
        }))
    }
}

#[async_trait]
impl DuplicateLookup for InMemoryRecordStore {
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<String>, ExternalError> {
        Ok(self
            .table
            .committed
            .lock()
            .iter()
            .find(|(_, r)| r.content_hash == content_hash)
            .map(|(id, _)| id.clone()))
    }
}

struct InMemorySession {
    table: Arc<RecordTable>,
    pending: Vec<(String, NewRecord)>,
}

#[async_trait]
impl RecordSession for InMemorySession {
    async fn insert(&mut self, record: NewRecord) -> Result<String, ExternalError> {
        let id = format!("rec-{}", self.table.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.pending.push((id.clone(), record));
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), ExternalError> {
        let Self { table, pending } = *self;
        if table.fail_commit {
            return Err(ExternalError::connection("database connection lost"));
        }
        table.committed.lock().extend(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
