//! # docbase-core
//!
//! The in-memory reference graph and change-propagation core of a document database
//! browser. It sits between an embedded document store and every UI surface (lists,
//! trees, previews, query results) and keeps all of them consistent while documents
//! are added, updated, removed, or whole databases and collections are closed.
//!
//! ## Overview
//!
//! Every open entity is represented by exactly one live node:
//!
//! - [`database::DatabaseReference`] owns one open store connection and the set of
//!   collections derived from it.
//! - [`collection::CollectionReference`] owns an ordered, lazily-materialized set of
//!   documents and translates store-level CRUD into node-level change events.
//! - [`document::DocumentReference`] wraps a single document body and points back at
//!   its owning collection.
//! - [`registry::DatabaseRegistry`] is the explicitly constructed process root that
//!   tracks open databases, deduplicates by location, and funnels shutdown.
//!
//! Mutations run to completion synchronously: a store call happens first, the
//! in-memory model follows only on success, and every affected observer is notified
//! through [`event::Broadcaster`] channels before the triggering call returns. The
//! shared change vocabulary is [`event::ReferenceAction`]: `Add`, `Update`, `Remove`,
//! `Dispose`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docbase_core::registry::DatabaseRegistry;
//! use docbase_core::store::ConnectionMode;
//!
//! fn main() -> Result<(), docbase_core::DocbaseError> {
//!     let registry = DatabaseRegistry::new();
//!     let db = registry.open("./inventory.db", ConnectionMode::Shared, None)?;
//!
//!     let albums = db.add_collection("albums")?;
//!     let _sub = albums.on_documents_changed(|action, docs| {
//!         println!("{action}: {} document(s)", docs.len());
//!     });
//!
//!     albums.import_json(r#"[{"title": "Blue"}, {"title": "Kind of Blue"}]"#)?;
//!
//!     registry.close_database(&db)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Teardown ordering
//!
//! Closing a database is two-phase: `before_dispose` broadcasts `Dispose` to every
//! collection and document while the store connection is still valid, so observers can
//! read final state from inside their handlers; only afterwards is the node unlinked
//! from the registry and the connection released. Both phases are idempotent and
//! guarded against double broadcast.
//!
//! ## Backing store
//!
//! The store is consumed through the narrow [`store::DataStore`] trait.
//! [`store::sqlite::SqliteStore`] is the embedded persistent implementation
//! (documents as JSON rows, password protection, blob storage);
//! [`store::memory::MemoryStore`] is the in-memory implementation used as the
//! reference semantics for the contract and as the test double.

pub mod collection;
pub mod database;
pub mod document;
pub mod error;
pub mod event;
pub mod reference;
pub mod registry;
pub mod store;

pub use error::*;
