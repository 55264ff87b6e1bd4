//! A collection of documents within an open database.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::DatabaseReference;
use crate::document::{serialize_value, DocumentReference};
use crate::error::DocbaseError;
use crate::event::{Broadcaster, ReferenceAction, Subscription};
use crate::reference::{InstanceId, ReferenceNode};
use crate::store::{is_files_or_chunks, DataStore, Record, ID_FIELD};

/// Coarse collection kind tag. `Files` marks the blob-metadata collection; its
/// hidden `chunks` counterpart never gets a node of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    Regular,
    Files,
}

/// Ordering mode for [`CollectionReference::distinct_keys`]. Drives UI column
/// order, so both modes must be deterministic for a given document set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrder {
    /// First-seen order across documents in enumeration order.
    Original,
    /// Lexicographic.
    Alphabetical,
}

/// Owns the ordered, lazily-materialized set of documents for one store-level
/// collection and translates store CRUD into node-level change events.
///
/// Two broadcast granularities exist: [`CollectionReference::on_changed`] carries
/// changes to the collection node itself, [`CollectionReference::on_documents_changed`]
/// carries the affected document batch. Every document mutation fires the
/// per-document channel first, then the batch channel, so consumers may subscribe
/// at either granularity.
#[derive(Debug)]
pub struct CollectionReference {
    instance_id: InstanceId,
    /// Renames happen in place so subscribers bound to this node keep working.
    name: RwLock<String>,
    kind: CollectionKind,
    database: Weak<DatabaseReference>,
    items: RwLock<Vec<Arc<DocumentReference>>>,
    materialized: AtomicBool,
    changed: Broadcaster<Arc<CollectionReference>>,
    documents_changed: Broadcaster<Vec<Arc<DocumentReference>>>,
    /// Set on entry to `dispose` to make it idempotent; `disposed` flips only
    /// after the `Dispose` broadcast so handlers can still read the item set.
    dispose_started: AtomicBool,
    disposed: AtomicBool,
    weak_self: Weak<CollectionReference>,
}

impl CollectionReference {
    pub(crate) fn new(
        name: &str,
        kind: CollectionKind,
        database: &Arc<DatabaseReference>,
    ) -> Arc<CollectionReference> {
        Arc::new_cyclic(|me| CollectionReference {
            instance_id: InstanceId::new(),
            name: RwLock::new(name.to_string()),
            kind,
            database: Arc::downgrade(database),
            items: RwLock::new(Vec::new()),
            materialized: AtomicBool::new(false),
            changed: Broadcaster::default(),
            documents_changed: Broadcaster::default(),
            dispose_started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            weak_self: me.clone(),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn database(&self) -> Option<Arc<DatabaseReference>> {
        self.database.upgrade()
    }

    /// True iff the collection's name matches the reserved files/chunks pair.
    pub fn is_files_or_chunks(&self) -> bool {
        is_files_or_chunks(&self.name())
    }

    pub fn on_changed<F>(&self, sink: F) -> Subscription<Arc<CollectionReference>>
    where
        F: Fn(ReferenceAction, &Arc<CollectionReference>) + Send + Sync + 'static,
    {
        self.changed.subscribe(sink)
    }

    pub fn on_documents_changed<F>(&self, sink: F) -> Subscription<Vec<Arc<DocumentReference>>>
    where
        F: Fn(ReferenceAction, &Vec<Arc<DocumentReference>>) + Send + Sync + 'static,
    {
        self.documents_changed.subscribe(sink)
    }

    fn emit(&self, action: ReferenceAction) {
        if let Some(me) = self.weak_self.upgrade() {
            self.changed.emit(action, &me);
        }
    }

    fn guard_active(&self) -> Result<(), DocbaseError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DocbaseError::Disposed);
        }
        Ok(())
    }

    fn store(&self) -> Result<Arc<dyn DataStore>, DocbaseError> {
        self.database
            .upgrade()
            .ok_or(DocbaseError::Disposed)?
            .store()
    }

    /// Materialize the items container from the store, exactly once per refresh
    /// cycle. Silent: first-time population must not be observable as an `Add`
    /// burst. Subsequent structural changes flow only through the explicit
    /// add/remove/update operations.
    pub fn ensure_loaded(&self) -> Result<(), DocbaseError> {
        self.guard_active()?;
        if self.materialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let me = self.weak_self.upgrade().ok_or(DocbaseError::Disposed)?;
        let records = self.store()?.enumerate(&self.name())?;
        let mut items = self.items.write();
        if !self.materialized.swap(true, Ordering::AcqRel) {
            items.clear();
            for record in records {
                items.push(DocumentReference::new(record, Some(&me)));
            }
        }
        Ok(())
    }

    /// Snapshot of the live document set, in store enumeration order. The same
    /// `DocumentReference` instances are returned across calls until
    /// [`CollectionReference::refresh`] replaces them.
    pub fn items(&self) -> Result<Vec<Arc<DocumentReference>>, DocbaseError> {
        self.ensure_loaded()?;
        Ok(self.items.read().clone())
    }

    /// Persist to the store, then wrap and append. A failed store insert leaves
    /// the in-memory set untouched.
    fn persist_and_link(&self, record: Record) -> Result<Arc<DocumentReference>, DocbaseError> {
        let me = self.weak_self.upgrade().ok_or(DocbaseError::Disposed)?;
        let name = self.name();
        let id = self.store()?.insert(&name, &record)?;
        let mut body = record;
        body.insert(ID_FIELD.to_string(), id);
        let doc = DocumentReference::new(body, Some(&me));
        self.items.write().push(doc.clone());
        Ok(doc)
    }

    pub fn add_item(&self, record: Record) -> Result<Arc<DocumentReference>, DocbaseError> {
        self.guard_active()?;
        self.ensure_loaded()?;
        let doc = self.persist_and_link(record)?;
        doc.emit(ReferenceAction::Add);
        self.documents_changed
            .emit(ReferenceAction::Add, &vec![doc.clone()]);
        tracing::debug!("Added document {} to {:?}", doc, self.name());
        Ok(doc)
    }

    /// Batch insert. Fires one document-scoped `Add` per document and exactly one
    /// collection-scoped batch `Add` carrying all of them, so the batch and the
    /// singles stay mutually consistent. On a mid-batch store failure the already
    /// persisted prefix remains (store and memory agree), the batch event covers
    /// that prefix, and the error is returned.
    pub fn import_records(
        &self,
        records: Vec<Record>,
    ) -> Result<Vec<Arc<DocumentReference>>, DocbaseError> {
        self.guard_active()?;
        self.ensure_loaded()?;
        let mut created = Vec::with_capacity(records.len());
        let mut failure = None;
        for record in records {
            match self.persist_and_link(record) {
                Ok(doc) => {
                    doc.emit(ReferenceAction::Add);
                    created.push(doc);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !created.is_empty() {
            self.documents_changed.emit(ReferenceAction::Add, &created);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    /// Import a JSON payload: a single object or an array of objects.
    pub fn import_json(&self, text: &str) -> Result<Vec<Arc<DocumentReference>>, DocbaseError> {
        let parsed: Value = serde_json::from_str(text)?;
        let records = match parsed {
            Value::Object(record) => vec![record],
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::Object(record) => Ok(record),
                    other => Err(DocbaseError::Serialization(format!(
                        "expected a JSON object, got {other}"
                    ))),
                })
                .collect::<Result<Vec<Record>, DocbaseError>>()?,
            other => {
                return Err(DocbaseError::Serialization(format!(
                    "expected a JSON object or array, got {other}"
                )))
            }
        };
        self.import_records(records)
    }

    /// Persist the document's current in-memory body, then broadcast `Update`.
    /// Trusts the in-memory state as source of truth post-write; no re-fetch.
    pub fn update_item(&self, doc: &Arc<DocumentReference>) -> Result<(), DocbaseError> {
        self.guard_active()?;
        if !doc.contains_reference(self) {
            return Err(DocbaseError::NotFound(format!(
                "document {doc} does not belong to collection {:?}",
                self.name()
            )));
        }
        let id = doc
            .id()
            .ok_or_else(|| DocbaseError::NotFound(format!("document {doc} has no _id")))?;
        let body = doc.body().ok_or(DocbaseError::Disposed)?;
        self.store()?.update(&self.name(), &id, &body)?;
        doc.emit(ReferenceAction::Update);
        self.documents_changed
            .emit(ReferenceAction::Update, &vec![doc.clone()]);
        Ok(())
    }

    /// Delete-then-unlink: the store delete runs first, so a failed delete leaves
    /// the document in `items` with no `Remove` broadcast. The removed document
    /// is disposed after the `Remove` broadcasts.
    pub fn remove_item(&self, doc: &Arc<DocumentReference>) -> Result<(), DocbaseError> {
        self.guard_active()?;
        if !doc.contains_reference(self) {
            return Err(DocbaseError::NotFound(format!(
                "document {doc} does not belong to collection {:?}",
                self.name()
            )));
        }
        let id = doc
            .id()
            .ok_or_else(|| DocbaseError::NotFound(format!("document {doc} has no _id")))?;
        self.store()?.delete(&self.name(), &id)?;
        {
            let mut items = self.items.write();
            if let Some(pos) = items
                .iter()
                .position(|item| item.instance_id() == doc.instance_id())
            {
                items.remove(pos);
            }
        }
        doc.emit(ReferenceAction::Remove);
        self.documents_changed
            .emit(ReferenceAction::Remove, &vec![doc.clone()]);
        doc.dispose();
        tracing::debug!("Removed document {id} from {:?}", self.name());
        Ok(())
    }

    /// Re-enumerate the store into the existing items container, in place, so
    /// observers bound to this node stay valid. Replaced document nodes are
    /// disposed; a single collection-scoped `Update` follows.
    pub fn refresh(&self) -> Result<(), DocbaseError> {
        self.guard_active()?;
        let me = self.weak_self.upgrade().ok_or(DocbaseError::Disposed)?;
        let records = self.store()?.enumerate(&self.name())?;
        let old: Vec<Arc<DocumentReference>> = {
            let mut items = self.items.write();
            let old = items.drain(..).collect();
            for record in records {
                items.push(DocumentReference::new(record, Some(&me)));
            }
            self.materialized.store(true, Ordering::Release);
            old
        };
        for doc in old {
            doc.dispose();
        }
        self.emit(ReferenceAction::Update);
        Ok(())
    }

    /// Union of field names across all materialized documents. `Original` is
    /// first-seen order and never reorders previously seen keys when documents
    /// are added later.
    pub fn distinct_keys(&self, order: KeyOrder) -> Result<Vec<String>, DocbaseError> {
        self.ensure_loaded()?;
        let mut keys = Vec::new();
        let mut seen = BTreeSet::new();
        for doc in self.items.read().iter() {
            if let Some(body) = doc.body() {
                for key in body.keys() {
                    if seen.insert(key.clone()) {
                        keys.push(key.clone());
                    }
                }
            }
        }
        if order == KeyOrder::Alphabetical {
            keys.sort();
        }
        Ok(keys)
    }

    /// JSON array export of all materialized documents.
    pub fn serialize_items(&self, pretty: bool, decoded: bool) -> Result<String, DocbaseError> {
        self.ensure_loaded()?;
        let bodies: Vec<Value> = self
            .items
            .read()
            .iter()
            .filter_map(|doc| doc.body().map(Value::Object))
            .collect();
        serialize_value(&Value::Array(bodies), pretty, decoded)
    }

    fn guard_files(&self) -> Result<(), DocbaseError> {
        if self.kind != CollectionKind::Files {
            return Err(DocbaseError::InvalidOperation(format!(
                "{:?} is not a files collection",
                self.name()
            )));
        }
        Ok(())
    }

    /// Blob content for a file id. Files variant only.
    pub fn read_file(&self, id: &str) -> Result<Vec<u8>, DocbaseError> {
        self.guard_files()?;
        self.store()?.read_file(id)
    }

    /// Write a blob's content to `target`. Files variant only.
    pub fn save_file(&self, id: &str, target: &Path) -> Result<(), DocbaseError> {
        self.guard_files()?;
        self.store()?.save_file(id, target)
    }

    /// Idempotent teardown. Fires the collection-scoped `Dispose` first, while the
    /// items container is still intact, then disposes every document (each fires
    /// its own `Dispose` with a readable body), then drops all registrations.
    pub fn dispose(&self) {
        if self.dispose_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(ReferenceAction::Dispose);
        let docs: Vec<Arc<DocumentReference>> = self.items.write().drain(..).collect();
        self.disposed.store(true, Ordering::Release);
        for doc in docs {
            doc.dispose();
        }
        self.changed.clear();
        self.documents_changed.clear();
        tracing::debug!("Disposed collection {:?}", self.name());
    }
}

impl ReferenceNode for CollectionReference {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Collection({})", self.name())
    }
}
