//! The process root: every open database, deduplicated by location.
//!
//! Explicitly constructed and passed where needed; there is no lazily-initialized
//! global. The embedding application creates one registry at startup and funnels
//! open/close through it.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::database::DatabaseReference;
use crate::error::DocbaseError;
use crate::event::{Broadcaster, ReferenceAction, Subscription};
use crate::reference::ReferenceNode;
use crate::store::ConnectionMode;

/// Tracks the ordered set of currently open databases. The uniqueness check and
/// the insert happen under one lock scope, so two concurrent opens of the same
/// location cannot both succeed.
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    databases: Mutex<Vec<Arc<DatabaseReference>>>,
    changed: Broadcaster<Arc<DatabaseReference>>,
}

impl DatabaseRegistry {
    pub fn new() -> DatabaseRegistry {
        DatabaseRegistry::default()
    }

    /// Observe databases entering (`Add`) and leaving (`Remove`) the registry.
    pub fn on_changed<F>(&self, sink: F) -> Subscription<Arc<DatabaseReference>>
    where
        F: Fn(ReferenceAction, &Arc<DatabaseReference>) + Send + Sync + 'static,
    {
        self.changed.subscribe(sink)
    }

    /// Open a store file and register the database, atomically refusing a
    /// location that is already open.
    pub fn open<P: AsRef<Path>>(
        &self,
        path: P,
        mode: ConnectionMode,
        password: Option<&str>,
    ) -> Result<Arc<DatabaseReference>, DocbaseError> {
        let path = path.as_ref();
        let db = {
            let mut databases = self.databases.lock();
            if databases
                .iter()
                .any(|db| same_location(db.location(), path))
            {
                return Err(DocbaseError::AlreadyOpen(format!("{}", path.display())));
            }
            let db = DatabaseReference::open(path, mode, password)?;
            databases.push(db.clone());
            db
        };
        self.changed.emit(ReferenceAction::Add, &db);
        Ok(db)
    }

    /// Register an externally constructed database node, with the same atomic
    /// location-uniqueness check as [`DatabaseRegistry::open`].
    pub fn insert(&self, db: Arc<DatabaseReference>) -> Result<(), DocbaseError> {
        {
            let mut databases = self.databases.lock();
            if databases
                .iter()
                .any(|open| same_location(open.location(), db.location()))
            {
                return Err(DocbaseError::AlreadyOpen(format!(
                    "{}",
                    db.location().display()
                )));
            }
            databases.push(db.clone());
        }
        self.changed.emit(ReferenceAction::Add, &db);
        Ok(())
    }

    /// Close one database: descendant broadcast, then unlink from the registry,
    /// then release. Observers keying off registry membership see the database
    /// gone before its connection closes. The membership check happens first,
    /// before anything is broadcast, so closing an unregistered database leaves
    /// it fully intact.
    pub fn close_database(&self, db: &Arc<DatabaseReference>) -> Result<(), DocbaseError> {
        let registered = self
            .databases
            .lock()
            .iter()
            .any(|open| open.instance_id() == db.instance_id());
        if !registered {
            return Err(DocbaseError::NotFound(format!(
                "database {}",
                db.location().display()
            )));
        }
        db.before_dispose();
        {
            let mut databases = self.databases.lock();
            if let Some(pos) = databases
                .iter()
                .position(|open| open.instance_id() == db.instance_id())
            {
                databases.remove(pos);
            }
        }
        self.changed.emit(ReferenceAction::Remove, db);
        db.dispose();
        Ok(())
    }

    /// Bulk/process-exit path: dispose everything without the `before_dispose`
    /// pre-broadcast and empty the registry.
    pub fn close_all(&self) {
        let databases: Vec<Arc<DatabaseReference>> =
            std::mem::take(&mut *self.databases.lock());
        for db in databases {
            db.dispose();
        }
    }

    pub fn is_open<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        self.databases
            .lock()
            .iter()
            .any(|db| same_location(db.location(), path))
    }

    pub fn find<P: AsRef<Path>>(&self, path: P) -> Option<Arc<DatabaseReference>> {
        let path = path.as_ref();
        self.databases
            .lock()
            .iter()
            .find(|db| same_location(db.location(), path))
            .cloned()
    }

    /// Snapshot of the open databases, in open order.
    pub fn databases(&self) -> Vec<Arc<DatabaseReference>> {
        self.databases.lock().clone()
    }
}

/// Location equality: canonicalized when both paths resolve (covers symlinks and
/// case-insensitive filesystems), lexical otherwise.
fn same_location(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}
