//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use docbase_core::database::DatabaseReference;
use docbase_core::event::ReferenceAction;
use docbase_core::reference::InstanceId;
use docbase_core::store::memory::MemoryStore;
use docbase_core::store::{DataStore, Record};

/// Build a record from field pairs.
#[allow(dead_code)]
pub fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// A memory store pre-populated with two collections:
/// `albums` (ids 1 and 2) and `tracks` (id 10).
#[allow(dead_code)]
pub fn seeded_store(location: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_location(location));
    store
        .insert(
            "albums",
            &record(&[("_id", Value::from(1)), ("title", Value::from("Blue"))]),
        )
        .unwrap();
    store
        .insert(
            "albums",
            &record(&[
                ("_id", Value::from(2)),
                ("title", Value::from("Kind of Blue")),
            ]),
        )
        .unwrap();
    store
        .insert(
            "tracks",
            &record(&[("_id", Value::from(10)), ("no", Value::from(1))]),
        )
        .unwrap();
    store
}

/// Open a database node over a seeded memory store.
#[allow(dead_code)]
pub fn seeded_db(location: &str) -> (Arc<MemoryStore>, Arc<DatabaseReference>) {
    let store = seeded_store(location);
    let db = DatabaseReference::from_store(store.clone()).unwrap();
    (store, db)
}

/// Collects `(action, instance_id)` pairs delivered by any broadcast channel.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(ReferenceAction, Vec<InstanceId>)>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn push(&self, action: ReferenceAction, ids: Vec<InstanceId>) {
        self.events.lock().push((action, ids));
    }

    pub fn push_one(&self, action: ReferenceAction, id: InstanceId) {
        self.push(action, vec![id]);
    }

    pub fn events(&self) -> Vec<(ReferenceAction, Vec<InstanceId>)> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<ReferenceAction> {
        self.events.lock().iter().map(|(a, _)| *a).collect()
    }

    pub fn count(&self, action: ReferenceAction) -> usize {
        self.events.lock().iter().filter(|(a, _)| *a == action).count()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
