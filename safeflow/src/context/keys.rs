//! Well-known context field names written by the document stages.

/// SHA-256 hex digest of the input content.
pub const CONTENT_HASH: &str = "content_hash";
/// Record ID of an earlier document with the same hash.
pub const DUPLICATE_OF: &str = "duplicate_of";
/// ID the blob store assigned to the uploaded content.
pub const REMOTE_FILE_ID: &str = "remote_file_id";
/// Structured data returned by the inference API.
pub const EXTRACTED: &str = "extracted";
/// ID of the persisted record.
pub const RECORD_ID: &str = "record_id";
/// ID of the search index entry.
pub const INDEX_ENTRY_ID: &str = "index_entry_id";
