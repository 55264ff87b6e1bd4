//! The backing-store seam.
//!
//! Everything the reference graph needs from an embedded document store is
//! expressed through the [`DataStore`] trait: list collection names, CRUD a record
//! by its store identifier within a named collection, rename or drop a collection,
//! and a blob facility keyed by the reserved `files`/`chunks` collection pair.
//!
//! [`sqlite::SqliteStore`] is the persistent implementation; [`memory::MemoryStore`]
//! is the in-memory reference implementation used by tests. Both agree on one point
//! that the collection-creation workaround depends on: a collection materializes on
//! first write and survives being emptied.

pub mod memory;
pub mod sqlite;

use std::fmt::Debug;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DocbaseError;

/// Name of the collection holding file metadata records.
pub const FILES_COLLECTION: &str = "files";

/// Name of the hidden counterpart collection holding file chunk records.
pub const CHUNKS_COLLECTION: &str = "chunks";

/// Field holding a record's store identifier.
pub const ID_FIELD: &str = "_id";

/// A document body: field name to dynamically-typed value. Field order is
/// insertion order (`serde_json/preserve_order`); it drives key enumeration and
/// therefore UI column order.
pub type Record = serde_json::Map<String, Value>;

/// How the underlying store file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    #[default]
    Shared,
    Exclusive,
    ReadOnly,
}

/// Narrow contract between the reference graph and the embedded store.
///
/// Every method may fail with a store-specific error; implementations must leave
/// their own state untouched on failure so the node layer can guarantee
/// no-partial-state. A wrong-password condition on open must surface as
/// [`DocbaseError::WrongPassword`], distinguishable from all other failures.
pub trait DataStore: Send + Sync + Debug {
    /// File path (or stand-in path) this store was opened from.
    fn location(&self) -> &Path;

    /// Names of all materialized collections, in store enumeration order.
    fn collection_names(&self) -> Result<Vec<String>, DocbaseError>;

    /// All records of a collection, in store enumeration order.
    fn enumerate(&self, collection: &str) -> Result<Vec<Record>, DocbaseError>;

    /// A single record by store identifier, or `None`.
    fn fetch(&self, collection: &str, id: &Value) -> Result<Option<Record>, DocbaseError>;

    /// Persist a new record. Assigns a store identifier when the body carries no
    /// `_id` field. Returns the identifier under which the record was stored.
    fn insert(&self, collection: &str, record: &Record) -> Result<Value, DocbaseError>;

    /// Replace the stored body of an existing record.
    fn update(&self, collection: &str, id: &Value, record: &Record) -> Result<(), DocbaseError>;

    /// Delete a record by store identifier. Deleting a missing record is an error.
    fn delete(&self, collection: &str, id: &Value) -> Result<(), DocbaseError>;

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), DocbaseError>;

    fn drop_collection(&self, name: &str) -> Result<(), DocbaseError>;

    /// Upload a binary blob from `source`, creating the `files` metadata record and
    /// its `chunks` records. Returns the metadata record.
    fn upload_file(&self, id: &str, source: &Path) -> Result<Record, DocbaseError>;

    fn file_exists(&self, id: &str) -> Result<bool, DocbaseError>;

    /// The reassembled blob content.
    fn read_file(&self, id: &str) -> Result<Vec<u8>, DocbaseError>;

    /// Write the reassembled blob content to `target`.
    fn save_file(&self, id: &str, target: &Path) -> Result<(), DocbaseError>;

    /// Release the underlying handle. Further operations fail. Called exactly once,
    /// by the owning `DatabaseReference` at dispose.
    fn close(&self);
}

/// Blob payloads are split into chunk records of this many bytes.
pub(crate) const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Field on a chunk record naming the blob it belongs to.
pub(crate) const FILE_ID_FIELD: &str = "file_id";

/// Build the `files` metadata record and the ordered `chunks` records for a blob.
pub(crate) fn build_file_records(
    id: &str,
    source: &Path,
    bytes: &[u8],
) -> (Record, Vec<Record>) {
    let chunks: Vec<Record> = bytes
        .chunks(FILE_CHUNK_SIZE)
        .enumerate()
        .map(|(n, chunk)| {
            let mut record = Record::new();
            record.insert(ID_FIELD.to_string(), Value::String(format!("{id}:{n}")));
            record.insert(FILE_ID_FIELD.to_string(), Value::String(id.to_string()));
            record.insert("n".to_string(), Value::from(n as u64));
            record.insert("data".to_string(), Value::String(hex::encode(chunk)));
            record
        })
        .collect();

    let mut meta = Record::new();
    meta.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    meta.insert(
        "filename".to_string(),
        Value::String(
            source
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    );
    meta.insert("length".to_string(), Value::from(bytes.len() as u64));
    meta.insert("chunks".to_string(), Value::from(chunks.len() as u64));
    (meta, chunks)
}

/// Reassemble a blob from its chunk records. `rows` is the full `chunks`
/// collection; rows belonging to other blobs are skipped.
pub(crate) fn reassemble_chunks(id: &str, rows: &[Record]) -> Result<Vec<u8>, DocbaseError> {
    let mut parts: Vec<(u64, &str)> = rows
        .iter()
        .filter(|row| {
            row.get(FILE_ID_FIELD)
                .and_then(Value::as_str)
                .map(|file| file == id)
                .unwrap_or(false)
        })
        .filter_map(|row| {
            let n = row.get("n").and_then(Value::as_u64)?;
            let data = row.get("data").and_then(Value::as_str)?;
            Some((n, data))
        })
        .collect();
    if parts.is_empty() {
        return Err(DocbaseError::NotFound(format!("file {id:?}")));
    }
    parts.sort_by_key(|(n, _)| *n);
    let mut bytes = Vec::new();
    for (_, data) in parts {
        bytes.extend(hex::decode(data)?);
    }
    Ok(bytes)
}

/// True iff `name` is one of the two reserved blob-storage collection names.
pub fn is_files_or_chunks(name: &str) -> bool {
    name == FILES_COLLECTION || name == CHUNKS_COLLECTION
}

/// Validate a user-supplied collection name: non-empty, starts with a letter or
/// underscore, contains only alphanumerics, `_` or `-`.
pub fn validate_collection_name(name: &str) -> Result<(), DocbaseError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(DocbaseError::InvalidFieldName(format!(
            "invalid collection name {name:?}"
        )))
    }
}
