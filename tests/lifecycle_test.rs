//! Teardown ordering and the structural database operations.

mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;

use common::{record, seeded_db, Recorder};
use docbase_core::collection::KeyOrder;
use docbase_core::event::ReferenceAction;
use docbase_core::reference::ReferenceNode;
use docbase_core::registry::DatabaseRegistry;
use docbase_core::store::DataStore;
use docbase_core::DocbaseError;

#[test_log::test]
fn close_broadcasts_dispose_with_readable_state() {
    let (_store, db) = seeded_db("mem://close-order");
    let registry = DatabaseRegistry::new();
    registry.insert(db.clone()).unwrap();

    let collections = db.collections();
    let mut subs = Vec::new();
    let observed = Arc::new(AtomicUsize::new(0));
    for collection in &collections {
        for doc in collection.items().unwrap() {
            let observed = observed.clone();
            subs.push(doc.on_changed(move |action, node| {
                if action == ReferenceAction::Dispose {
                    // Inside the Dispose handler the final state must still be
                    // readable.
                    assert!(node.id().is_some());
                    assert!(node.body().is_some());
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
    }

    registry.close_database(&db).unwrap();

    // Two albums plus one track.
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert!(db.is_disposed());
    for collection in &collections {
        assert!(collection.is_disposed());
    }
    drop(subs);
}

#[test_log::test]
fn disposed_nodes_reject_operations() {
    let (_store, db) = seeded_db("mem://disposed-ops");
    let albums = db.collection("albums").unwrap();
    let doc = albums.items().unwrap()[0].clone();

    db.before_dispose();
    db.dispose();

    // The read paths reject too, even though the collection was already
    // materialized before teardown.
    assert!(matches!(albums.items(), Err(DocbaseError::Disposed)));
    assert!(matches!(albums.ensure_loaded(), Err(DocbaseError::Disposed)));
    assert!(matches!(
        albums.distinct_keys(KeyOrder::Original),
        Err(DocbaseError::Disposed)
    ));
    assert!(matches!(
        albums.serialize_items(false, true),
        Err(DocbaseError::Disposed)
    ));
    assert!(matches!(
        albums.add_item(record(&[("x", Value::from(1))])),
        Err(DocbaseError::Disposed)
    ));
    assert!(matches!(db.add_collection("new"), Err(DocbaseError::Disposed)));
    assert!(matches!(db.refresh(), Err(DocbaseError::Disposed)));
    assert!(doc.body().is_none());
    assert!(matches!(
        doc.set("x", Value::from(1)),
        Err(DocbaseError::Disposed)
    ));
}

#[test_log::test]
fn dispose_after_before_dispose_broadcasts_once() {
    let (_store, db) = seeded_db("mem://single-dispose");
    let albums = db.collection("albums").unwrap();
    let doc = albums.items().unwrap()[0].clone();

    let doc_events = Recorder::default();
    let d = doc_events.clone();
    let _doc_sub = doc.on_changed(move |action, node| {
        d.push_one(action, node.instance_id());
    });
    let coll_events = Recorder::default();
    let c = coll_events.clone();
    let _coll_sub = albums.on_changed(move |action, coll| {
        c.push_one(action, coll.instance_id());
    });

    db.before_dispose();
    db.before_dispose();
    db.dispose();
    db.dispose();

    assert_eq!(doc_events.actions(), vec![ReferenceAction::Dispose]);
    assert_eq!(coll_events.actions(), vec![ReferenceAction::Dispose]);
}

#[test_log::test]
fn collection_dispose_precedes_document_dispose() {
    let (_store, db) = seeded_db("mem://dispose-order");
    let albums = db.collection("albums").unwrap();
    let docs = albums.items().unwrap();

    // Record interleaving: the collection's own Dispose must arrive while its
    // items are still intact, before any document Dispose.
    let order = Recorder::default();
    let o = order.clone();
    let expected = docs.len();
    let _coll_sub = albums.on_changed(move |action, coll| {
        assert_eq!(coll.items().unwrap().len(), expected);
        o.push_one(action, coll.instance_id());
    });
    let mut doc_subs = Vec::new();
    for doc in &docs {
        let o = order.clone();
        doc_subs.push(doc.on_changed(move |action, node| {
            o.push_one(action, node.instance_id());
        }));
    }

    albums.dispose();

    let events = order.events();
    assert_eq!(events.len(), 1 + docs.len());
    assert_eq!(events[0].1, vec![albums.instance_id()]);
    for (action, _) in &events {
        assert_eq!(*action, ReferenceAction::Dispose);
    }
}

#[test_log::test]
fn add_collection_round_trip() {
    let (store, db) = seeded_db("mem://add-coll");

    let node = db.add_collection("playlists").unwrap();
    assert_eq!(node.name(), "playlists");
    assert!(node.items().unwrap().is_empty());
    assert!(db.collections_lookup().contains_key("playlists"));

    // The creation workaround leaves no placeholder behind.
    assert!(store.enumerate("playlists").unwrap().is_empty());
    assert!(store
        .collection_names()
        .unwrap()
        .contains(&"playlists".to_string()));

    // And the new collection is immediately usable.
    node.add_item(record(&[("name", Value::from("mix"))])).unwrap();
    assert_eq!(node.items().unwrap().len(), 1);
}

#[test_log::test]
fn add_collection_rejections() {
    let (_store, db) = seeded_db("mem://add-coll-bad");
    assert!(matches!(
        db.add_collection("albums"),
        Err(DocbaseError::DuplicateName(_))
    ));
    assert!(matches!(
        db.add_collection("chunks"),
        Err(DocbaseError::InvalidOperation(_))
    ));
    assert!(db.add_collection("").is_err());
    assert!(db.add_collection("9lives").is_err());
    assert!(db.add_collection("a b").is_err());
}

#[test_log::test]
fn add_collection_replaces_sibling_nodes() {
    let (_store, db) = seeded_db("mem://add-coll-refresh");
    let albums_before = db.collection("albums").unwrap();

    let db_events = Recorder::default();
    let e = db_events.clone();
    let _sub = db.on_changed(move |action, node| {
        e.push_one(action, node.instance_id());
    });

    db.add_collection("playlists").unwrap();

    // The collection set was re-derived: the old node is disposed and a fresh
    // one answers to the name now.
    assert!(albums_before.is_disposed());
    let albums_after = db.collection("albums").unwrap();
    assert!(!Arc::ptr_eq(&albums_before, &albums_after));
    assert_eq!(db_events.actions(), vec![ReferenceAction::Update]);
}

#[test_log::test]
fn drop_collection_broadcasts_and_disposes() {
    let (store, db) = seeded_db("mem://drop-coll");
    let tracks = db.collection("tracks").unwrap();

    let removed = Recorder::default();
    let r = removed.clone();
    let _sub = db.on_collections_changed(move |action, nodes| {
        r.push(action, nodes.iter().map(|n| n.instance_id()).collect());
    });

    db.drop_collection("tracks").unwrap();

    assert_eq!(
        removed.events(),
        vec![(ReferenceAction::Remove, vec![tracks.instance_id()])]
    );
    assert!(tracks.is_disposed());
    assert!(db.collection("tracks").is_none());
    assert!(!db.collections_lookup().contains_key("tracks"));
    assert!(!store
        .collection_names()
        .unwrap()
        .contains(&"tracks".to_string()));

    assert!(matches!(
        db.drop_collection("tracks"),
        Err(DocbaseError::NotFound(_))
    ));
    assert!(matches!(
        db.drop_collection("chunks"),
        Err(DocbaseError::InvalidOperation(_))
    ));
}

#[test_log::test]
fn add_file_wraps_metadata_document() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("artwork.png");
    let payload = vec![42u8; 70_000];
    fs::write(&source, &payload).unwrap();

    let (_store, db) = seeded_db("mem://add-file");
    assert!(!db.file_exists("artwork").unwrap());

    let doc = db.add_file("artwork", &source).unwrap();
    assert_eq!(doc.id(), Some(Value::from("artwork")));
    assert_eq!(doc.get("filename"), Some(Value::from("artwork.png")));
    assert_eq!(doc.get("length"), Some(Value::from(payload.len() as u64)));
    assert!(db.file_exists("artwork").unwrap());

    // Files collection materialized on first upload; chunks stays hidden.
    let files = db.collection("files").unwrap();
    assert_eq!(files.read_file("artwork").unwrap(), payload);
    assert!(db.collection("chunks").is_none());

    assert!(matches!(
        db.add_file("artwork", &source),
        Err(DocbaseError::DuplicateName(_))
    ));
}
