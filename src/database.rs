//! One open database file and the collections derived from it.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use crate::collection::{CollectionKind, CollectionReference};
use crate::document::DocumentReference;
use crate::error::DocbaseError;
use crate::event::{Broadcaster, ReferenceAction, Subscription};
use crate::reference::{InstanceId, ReferenceNode};
use crate::store::{
    sqlite::SqliteStore, validate_collection_name, ConnectionMode, DataStore, Record,
    CHUNKS_COLLECTION, FILES_COLLECTION, ID_FIELD,
};

/// Owns the physical store connection for one open database and the set of
/// collection nodes derived from it.
///
/// The connection is exclusively owned by this node: all access is mediated
/// through node operations, and it is released exactly once, at dispose. Teardown
/// is two-phase (see [`DatabaseReference::before_dispose`]) so observers can read
/// final state while the connection is still valid.
#[derive(Debug)]
pub struct DatabaseReference {
    instance_id: InstanceId,
    name: String,
    location: PathBuf,
    store: RwLock<Option<Arc<dyn DataStore>>>,
    collections: RwLock<Vec<Arc<CollectionReference>>>,
    /// Every known store-level collection name with its kind tag, including the
    /// hidden `chunks` collection that never gets a node.
    collections_lookup: RwLock<BTreeMap<String, CollectionKind>>,
    changed: Broadcaster<Arc<DatabaseReference>>,
    collections_changed: Broadcaster<Vec<Arc<CollectionReference>>>,
    before_dispose_handled: AtomicBool,
    disposed: AtomicBool,
    weak_self: Weak<DatabaseReference>,
}

impl DatabaseReference {
    /// Open a store file and derive the initial collection set. The node only
    /// becomes observable through the registry, which broadcasts the `Add` after
    /// construction completed.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: ConnectionMode,
        password: Option<&str>,
    ) -> Result<Arc<DatabaseReference>, DocbaseError> {
        let store = SqliteStore::open(path, mode, password)?;
        DatabaseReference::from_store(Arc::new(store))
    }

    /// Wrap an already-open backing store. Used directly by tests and by
    /// embedders that bring their own [`DataStore`].
    pub fn from_store(store: Arc<dyn DataStore>) -> Result<Arc<DatabaseReference>, DocbaseError> {
        let location = store.location().to_path_buf();
        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| location.display().to_string());
        let db = Arc::new_cyclic(|me| DatabaseReference {
            instance_id: InstanceId::new(),
            name,
            location,
            store: RwLock::new(Some(store)),
            collections: RwLock::new(Vec::new()),
            collections_lookup: RwLock::new(BTreeMap::new()),
            changed: Broadcaster::default(),
            collections_changed: Broadcaster::default(),
            before_dispose_handled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            weak_self: me.clone(),
        });
        db.derive_collections()?;
        tracing::debug!("Opened database {db}");
        Ok(db)
    }

    /// Probe whether the file at `path` requires credentials, distinguishing
    /// wrong-password from every other open failure. Used before prompting.
    pub fn is_password_protected<P: AsRef<Path>>(path: P) -> Result<bool, DocbaseError> {
        SqliteStore::is_password_protected(path)
    }

    /// Derived from the file name; the location stays authoritative.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File path, immutable for the node's life.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn on_changed<F>(&self, sink: F) -> Subscription<Arc<DatabaseReference>>
    where
        F: Fn(ReferenceAction, &Arc<DatabaseReference>) + Send + Sync + 'static,
    {
        self.changed.subscribe(sink)
    }

    pub fn on_collections_changed<F>(&self, sink: F) -> Subscription<Vec<Arc<CollectionReference>>>
    where
        F: Fn(ReferenceAction, &Vec<Arc<CollectionReference>>) + Send + Sync + 'static,
    {
        self.collections_changed.subscribe(sink)
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

    pub(crate) fn store(&self) -> Result<Arc<dyn DataStore>, DocbaseError> {
        self.store.read().clone().ok_or(DocbaseError::Disposed)
    }

    /// Snapshot of the owned collection nodes. `chunks` is never among them.
    pub fn collections(&self) -> Vec<Arc<CollectionReference>> {
        self.collections.read().clone()
    }

    /// Lookup by current name, case-sensitive per store semantics.
    pub fn collection(&self, name: &str) -> Option<Arc<CollectionReference>> {
        self.collections
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn collections_lookup(&self) -> BTreeMap<String, CollectionKind> {
        self.collections_lookup.read().clone()
    }

    /// Re-derive lookup and nodes from the store. Returns the replaced nodes;
    /// the caller decides whether to dispose them.
    fn derive_collections(&self) -> Result<Vec<Arc<CollectionReference>>, DocbaseError> {
        let me = self.weak_self.upgrade().ok_or(DocbaseError::Disposed)?;
        let names = self.store()?.collection_names()?;
        let mut lookup = BTreeMap::new();
        let mut nodes = Vec::new();
        for name in &names {
            let kind = if crate::store::is_files_or_chunks(name) {
                CollectionKind::Files
            } else {
                CollectionKind::Regular
            };
            lookup.insert(name.clone(), kind);
            if name != CHUNKS_COLLECTION {
                nodes.push(CollectionReference::new(name, kind, &me));
            }
        }
        let old = {
            let mut collections = self.collections.write();
            std::mem::replace(&mut *collections, nodes)
        };
        *self.collections_lookup.write() = lookup;
        Ok(old)
    }

    /// Fully re-derive the collection set. Old collection nodes are discarded and
    /// disposed, not diffed; observers holding a stale node rely on its `Dispose`
    /// broadcast. A single self `Update` follows.
    pub fn refresh(&self) -> Result<(), DocbaseError> {
        self.guard_active()?;
        let old = self.derive_collections()?;
        for collection in old {
            collection.dispose();
        }
        self.emit(ReferenceAction::Update);
        Ok(())
    }

    /// Create a collection. The duplicate check runs against the live store name
    /// list immediately before creation, not the lookup cache. The store only
    /// materializes a collection on first write, hence the insert-then-delete of
    /// a placeholder record.
    pub fn add_collection(&self, name: &str) -> Result<Arc<CollectionReference>, DocbaseError> {
        self.guard_active()?;
        validate_collection_name(name)?;
        if name == CHUNKS_COLLECTION {
            return Err(DocbaseError::InvalidOperation(
                "the chunks collection is managed by file storage".to_string(),
            ));
        }
        let store = self.store()?;
        if store.collection_names()?.iter().any(|n| n == name) {
            return Err(DocbaseError::DuplicateName(name.to_string()));
        }
        let placeholder = Record::new();
        let id = store.insert(name, &placeholder)?;
        store.delete(name, &id)?;
        self.refresh()?;
        self.collection(name)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {name:?}")))
    }

    /// Rename in the store, then update the existing node's name in place so
    /// subscribers bound to that instance keep working. No structural broadcast.
    pub fn rename_collection(&self, old: &str, new: &str) -> Result<(), DocbaseError> {
        self.guard_active()?;
        validate_collection_name(new)?;
        if crate::store::is_files_or_chunks(old) || crate::store::is_files_or_chunks(new) {
            return Err(DocbaseError::InvalidOperation(
                "the files and chunks collections cannot be renamed".to_string(),
            ));
        }
        let kind = self
            .collections_lookup
            .read()
            .get(old)
            .copied()
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {old:?}")))?;
        let store = self.store()?;
        if store.collection_names()?.iter().any(|n| n == new) {
            return Err(DocbaseError::DuplicateName(new.to_string()));
        }
        store.rename_collection(old, new)?;
        {
            let mut lookup = self.collections_lookup.write();
            lookup.remove(old);
            lookup.insert(new.to_string(), kind);
        }
        if let Some(node) = self.collection(old) {
            node.set_name(new);
        }
        tracing::debug!("Renamed collection {old:?} to {new:?} in {self}");
        Ok(())
    }

    /// Drop in the store, then unlink the node, broadcast `Remove` on the
    /// collections channel, and dispose the node. Dropping `files` drops its
    /// hidden `chunks` counterpart with it.
    pub fn drop_collection(&self, name: &str) -> Result<(), DocbaseError> {
        self.guard_active()?;
        if name == CHUNKS_COLLECTION {
            return Err(DocbaseError::InvalidOperation(
                "the chunks collection is managed by file storage".to_string(),
            ));
        }
        if !self.collections_lookup.read().contains_key(name) {
            return Err(DocbaseError::NotFound(format!("collection {name:?}")));
        }
        let store = self.store()?;
        store.drop_collection(name)?;
        if name == FILES_COLLECTION {
            match store.drop_collection(CHUNKS_COLLECTION) {
                Ok(()) | Err(DocbaseError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }
        {
            let mut lookup = self.collections_lookup.write();
            lookup.remove(name);
            if name == FILES_COLLECTION {
                lookup.remove(CHUNKS_COLLECTION);
            }
        }
        let node = {
            let mut collections = self.collections.write();
            collections
                .iter()
                .position(|c| c.name() == name)
                .map(|pos| collections.remove(pos))
        };
        if let Some(node) = node {
            self.collections_changed
                .emit(ReferenceAction::Remove, &vec![node.clone()]);
            node.dispose();
        }
        tracing::debug!("Dropped collection {name:?} from {self}");
        Ok(())
    }

    /// Upload a blob and return the wrapped metadata document. Re-derives the
    /// collection set afterwards, because the first upload lazily materializes
    /// the files/chunks collections.
    pub fn add_file(
        &self,
        id: &str,
        source: &Path,
    ) -> Result<Arc<DocumentReference>, DocbaseError> {
        self.guard_active()?;
        if self.file_exists(id)? {
            return Err(DocbaseError::DuplicateName(id.to_string()));
        }
        self.store()?.upload_file(id, source)?;
        self.refresh()?;
        let files = self
            .collection(FILES_COLLECTION)
            .ok_or_else(|| DocbaseError::NotFound(format!("collection {FILES_COLLECTION:?}")))?;
        let wanted = Value::String(id.to_string());
        files
            .items()?
            .into_iter()
            .find(|doc| doc.get(ID_FIELD).as_ref() == Some(&wanted))
            .ok_or_else(|| DocbaseError::NotFound(format!("file {id:?}")))
    }

    pub fn file_exists(&self, id: &str) -> Result<bool, DocbaseError> {
        self.guard_active()?;
        self.store()?.file_exists(id)
    }

    /// First phase of teardown: eagerly broadcast `Dispose` through every
    /// collection and document while the store connection is still valid, so slow
    /// observers can still read final state. Idempotent; `dispose` skips the
    /// broadcast when this already ran.
    pub fn before_dispose(&self) {
        if self.before_dispose_handled.swap(true, Ordering::AcqRel) {
            return;
        }
        let collections: Vec<Arc<CollectionReference>> = self.collections.read().clone();
        for collection in collections {
            collection.dispose();
        }
    }

    /// Terminal teardown: repeat the descendant broadcast only if
    /// `before_dispose` never ran, fire the self `Dispose`, then release the
    /// store connection exactly once. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.before_dispose_handled.swap(true, Ordering::AcqRel) {
            let collections: Vec<Arc<CollectionReference>> = self.collections.read().clone();
            for collection in collections {
                collection.dispose();
            }
        }
        self.emit(ReferenceAction::Dispose);
        self.changed.clear();
        self.collections_changed.clear();
        if let Some(store) = self.store.write().take() {
            store.close();
        }
        self.collections.write().clear();
        self.collections_lookup.write().clear();
        tracing::debug!("Disposed database {}", self.name);
    }
}

impl ReferenceNode for DatabaseReference {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Display for DatabaseReference {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Database({})", self.name)
    }
}
