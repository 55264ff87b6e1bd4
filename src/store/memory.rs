//! In-memory [`DataStore`] implementation.
//!
//! Serves two roles: the reference semantics for the store contract, and the test
//! double for the node layer. The failure-injection switches let tests exercise the
//! no-partial-state guarantees without a real store error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DocbaseError;
use crate::store::{
    build_file_records, reassemble_chunks, DataStore, Record, CHUNKS_COLLECTION,
    FILES_COLLECTION, ID_FIELD,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    location: PathBuf,
    /// Materialized collection names, in first-write order. A name stays in the
    /// catalog when its last record is deleted; only `drop_collection` removes it.
    catalog: Mutex<Vec<String>>,
    records: Mutex<BTreeMap<String, Vec<Record>>>,
    fail_next_insert: AtomicBool,
    fail_next_delete: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::with_location(":memory:")
    }

    pub fn with_location<P: AsRef<Path>>(location: P) -> MemoryStore {
        MemoryStore {
            location: location.as_ref().to_path_buf(),
            ..MemoryStore::default()
        }
    }

    /// Make the next `insert` call fail, leaving the store untouched.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next `delete` call fail, leaving the store untouched.
    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }

    fn guard_open(&self) -> Result<(), DocbaseError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DocbaseError::Store("store is closed".to_string()));
        }
        Ok(())
    }

    fn register(&self, collection: &str) {
        let mut catalog = self.catalog.lock();
        if !catalog.iter().any(|name| name == collection) {
            catalog.push(collection.to_string());
        }
    }
}

impl DataStore for MemoryStore {
    fn location(&self) -> &Path {
        &self.location
    }

    fn collection_names(&self) -> Result<Vec<String>, DocbaseError> {
        self.guard_open()?;
        Ok(self.catalog.lock().clone())
    }

    fn enumerate(&self, collection: &str) -> Result<Vec<Record>, DocbaseError> {
        self.guard_open()?;
        Ok(self
            .records
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn fetch(&self, collection: &str, id: &Value) -> Result<Option<Record>, DocbaseError> {
        self.guard_open()?;
        Ok(self.records.lock().get(collection).and_then(|rows| {
            rows.iter()
                .find(|row| row.get(ID_FIELD) == Some(id))
                .cloned()
        }))
    }

    fn insert(&self, collection: &str, record: &Record) -> Result<Value, DocbaseError> {
        self.guard_open()?;
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(DocbaseError::Store("injected insert failure".to_string()));
        }
        let id = record
            .get(ID_FIELD)
            .cloned()
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        let mut body = record.clone();
        body.insert(ID_FIELD.to_string(), id.clone());

        let mut records = self.records.lock();
        let rows = records.entry(collection.to_string()).or_default();
        if rows.iter().any(|row| row.get(ID_FIELD) == Some(&id)) {
            return Err(DocbaseError::Store(format!(
                "duplicate _id in collection {collection:?}: {id}"
            )));
        }
        rows.push(body);
        drop(records);
        self.register(collection);
        Ok(id)
    }

    fn update(&self, collection: &str, id: &Value, record: &Record) -> Result<(), DocbaseError> {
        self.guard_open()?;
        let mut records = self.records.lock();
        let rows = records
            .get_mut(collection)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {collection:?}")))?;
        let row = rows
            .iter_mut()
            .find(|row| row.get(ID_FIELD) == Some(id))
            .ok_or_else(|| DocbaseError::NotFound(format!("record {id} in {collection:?}")))?;
        let mut body = record.clone();
        body.insert(ID_FIELD.to_string(), id.clone());
        *row = body;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &Value) -> Result<(), DocbaseError> {
        self.guard_open()?;
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(DocbaseError::Store("injected delete failure".to_string()));
        }
        let mut records = self.records.lock();
        let rows = records
            .get_mut(collection)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {collection:?}")))?;
        let pos = rows
            .iter()
            .position(|row| row.get(ID_FIELD) == Some(id))
            .ok_or_else(|| DocbaseError::NotFound(format!("record {id} in {collection:?}")))?;
        rows.remove(pos);
        Ok(())
    }

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), DocbaseError> {
        self.guard_open()?;
        let mut catalog = self.catalog.lock();
        if catalog.iter().any(|name| name == to) {
            return Err(DocbaseError::DuplicateName(to.to_string()));
        }
        let slot = catalog
            .iter_mut()
            .find(|name| name.as_str() == from)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {from:?}")))?;
        *slot = to.to_string();
        drop(catalog);

        let mut records = self.records.lock();
        if let Some(rows) = records.remove(from) {
            records.insert(to.to_string(), rows);
        }
        Ok(())
    }

    fn drop_collection(&self, name: &str) -> Result<(), DocbaseError> {
        self.guard_open()?;
        let mut catalog = self.catalog.lock();
        let pos = catalog
            .iter()
            .position(|entry| entry == name)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {name:?}")))?;
        catalog.remove(pos);
        drop(catalog);
        self.records.lock().remove(name);
        Ok(())
    }

    fn upload_file(&self, id: &str, source: &Path) -> Result<Record, DocbaseError> {
        self.guard_open()?;
        let bytes = fs::read(source)?;
        let (meta, chunks) = build_file_records(id, source, &bytes);
        self.insert(FILES_COLLECTION, &meta)?;
        for chunk in &chunks {
            self.insert(CHUNKS_COLLECTION, chunk)?;
        }
        Ok(meta)
    }

    fn file_exists(&self, id: &str) -> Result<bool, DocbaseError> {
        let wanted = Value::String(id.to_string());
        Ok(self.fetch(FILES_COLLECTION, &wanted)?.is_some())
    }

    fn read_file(&self, id: &str) -> Result<Vec<u8>, DocbaseError> {
        let rows = self.enumerate(CHUNKS_COLLECTION)?;
        reassemble_chunks(id, &rows)
    }

    fn save_file(&self, id: &str, target: &Path) -> Result<(), DocbaseError> {
        let bytes = self.read_file(id)?;
        fs::write(target, bytes)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_assigns_id_and_preserves_order() {
        let store = MemoryStore::new();
        let a = store
            .insert("albums", &record(&[("title", Value::from("one"))]))
            .unwrap();
        let b = store
            .insert("albums", &record(&[("title", Value::from("two"))]))
            .unwrap();
        assert_ne!(a, b);

        let rows = store.enumerate("albums").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("title"), Some(&Value::from("one")));
        assert_eq!(rows[0].get(ID_FIELD), Some(&a));
        assert_eq!(rows[1].get("title"), Some(&Value::from("two")));
    }

    #[test]
    fn collection_survives_emptying() {
        let store = MemoryStore::new();
        let id = store.insert("albums", &Record::new()).unwrap();
        store.delete("albums", &id).unwrap();
        assert_eq!(store.collection_names().unwrap(), vec!["albums"]);
        assert!(store.enumerate("albums").unwrap().is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let store = MemoryStore::new();
        let body = record(&[(ID_FIELD, Value::from(1))]);
        store.insert("albums", &body).unwrap();
        assert!(store.insert("albums", &body).is_err());
    }

    #[test]
    fn injected_failures_leave_state_untouched() {
        let store = MemoryStore::new();
        let id = store.insert("albums", &Record::new()).unwrap();

        store.fail_next_delete();
        assert!(store.delete("albums", &id).is_err());
        assert_eq!(store.enumerate("albums").unwrap().len(), 1);

        store.fail_next_insert();
        assert!(store.insert("albums", &Record::new()).is_err());
        assert_eq!(store.enumerate("albums").unwrap().len(), 1);

        // Switches are one-shot.
        store.delete("albums", &id).unwrap();
    }

    #[test]
    fn rename_and_drop() {
        let store = MemoryStore::new();
        store.insert("old", &Record::new()).unwrap();
        store.rename_collection("old", "new").unwrap();
        assert_eq!(store.collection_names().unwrap(), vec!["new"]);
        assert_eq!(store.enumerate("new").unwrap().len(), 1);
        assert!(store.rename_collection("missing", "x").is_err());

        store.drop_collection("new").unwrap();
        assert!(store.collection_names().unwrap().is_empty());
    }

    #[test]
    fn blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.bin");
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &payload).unwrap();

        let store = MemoryStore::new();
        let meta = store.upload_file("photo-1", &source).unwrap();
        assert_eq!(meta.get("length"), Some(&Value::from(payload.len() as u64)));
        assert!(store.file_exists("photo-1").unwrap());
        assert!(!store.file_exists("photo-2").unwrap());

        // Two collections materialized, chunks split at the chunk size.
        let names = store.collection_names().unwrap();
        assert_eq!(names, vec![FILES_COLLECTION, CHUNKS_COLLECTION]);
        assert_eq!(store.read_file("photo-1").unwrap(), payload);

        let target = dir.path().join("copy.bin");
        store.save_file("photo-1", &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = MemoryStore::new();
        store.close();
        assert!(store.collection_names().is_err());
        assert!(store.insert("albums", &Record::new()).is_err());
    }
}
