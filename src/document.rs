//! A single document within an open collection.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use crate::collection::CollectionReference;
use crate::error::DocbaseError;
use crate::event::{Broadcaster, ReferenceAction, Subscription};
use crate::reference::{InstanceId, ReferenceNode};
use crate::store::{Record, ID_FIELD};

/// Wraps one document's field data and points back at its owning collection.
///
/// The back-reference is weak: the collection is the canonical owner, every other
/// holder observes through [`DocumentReference::on_changed`]. Field writes via
/// [`DocumentReference::set`] do not broadcast by themselves; persistence and the
/// `Update` broadcast go through `CollectionReference::update_item`.
#[derive(Debug)]
pub struct DocumentReference {
    instance_id: InstanceId,
    body: RwLock<Option<Record>>,
    collection: RwLock<Option<Weak<CollectionReference>>>,
    changed: Broadcaster<Arc<DocumentReference>>,
    disposed: AtomicBool,
    weak_self: Weak<DocumentReference>,
}

impl DocumentReference {
    /// Wrap a store record. `owner` is absent for standalone documents (query
    /// results, previews of external data).
    pub fn new(body: Record, owner: Option<&Arc<CollectionReference>>) -> Arc<DocumentReference> {
        Arc::new_cyclic(|me| DocumentReference {
            instance_id: InstanceId::new(),
            body: RwLock::new(Some(body)),
            collection: RwLock::new(owner.map(Arc::downgrade)),
            changed: Broadcaster::default(),
            disposed: AtomicBool::new(false),
            weak_self: me.clone(),
        })
    }

    pub fn on_changed<F>(&self, sink: F) -> Subscription<Arc<DocumentReference>>
    where
        F: Fn(ReferenceAction, &Arc<DocumentReference>) + Send + Sync + 'static,
    {
        self.changed.subscribe(sink)
    }

    pub(crate) fn emit(&self, action: ReferenceAction) {
        if let Some(me) = self.weak_self.upgrade() {
            self.changed.emit(action, &me);
        }
    }

    /// The document's store identifier (`_id` field), if assigned.
    pub fn id(&self) -> Option<Value> {
        self.body
            .read()
            .as_ref()
            .and_then(|body| body.get(ID_FIELD).cloned())
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.body
            .read()
            .as_ref()
            .and_then(|body| body.get(field).cloned())
    }

    /// Set one field of the in-memory body. Does not persist and does not
    /// broadcast; call `CollectionReference::update_item` afterwards.
    pub fn set(&self, field: &str, value: Value) -> Result<(), DocbaseError> {
        validate_field_name(field)?;
        let mut body = self.body.write();
        let body = body.as_mut().ok_or(DocbaseError::Disposed)?;
        body.insert(field.to_string(), value);
        Ok(())
    }

    /// Snapshot of the current body. `None` after dispose.
    pub fn body(&self) -> Option<Record> {
        self.body.read().clone()
    }

    /// Replace the whole in-memory body, keeping the store identifier. Same
    /// persistence contract as [`DocumentReference::set`].
    pub fn set_body(&self, new_body: Record) -> Result<(), DocbaseError> {
        let mut body = self.body.write();
        let slot = body.as_mut().ok_or(DocbaseError::Disposed)?;
        let id = slot.get(ID_FIELD).cloned();
        *slot = new_body;
        if let Some(id) = id {
            slot.insert(ID_FIELD.to_string(), id);
        }
        Ok(())
    }

    pub fn collection(&self) -> Option<Arc<CollectionReference>> {
        self.collection.read().as_ref().and_then(Weak::upgrade)
    }

    /// True iff this document belongs to exactly this open collection instance,
    /// not merely a same-named one.
    pub fn contains_reference(&self, collection: &CollectionReference) -> bool {
        self.collection()
            .map(|owner| owner.instance_id() == collection.instance_id())
            .unwrap_or(false)
    }

    /// Remove this document through its owning collection. `Ok` no-op when
    /// already detached.
    pub fn remove_self(&self) -> Result<(), DocbaseError> {
        let Some(owner) = self.collection() else {
            return Ok(());
        };
        let me = self.weak_self.upgrade().ok_or(DocbaseError::Disposed)?;
        owner.remove_item(&me)
    }

    /// Textual (JSON) representation of the body. `pretty` controls indentation;
    /// `decoded` keeps non-ASCII characters literal, while `false` escapes them as
    /// `\uXXXX` sequences the way the embedded store's native serializer does.
    pub fn serialize(&self, pretty: bool, decoded: bool) -> Result<String, DocbaseError> {
        let body = self.body().ok_or(DocbaseError::Disposed)?;
        serialize_value(&Value::Object(body), pretty, decoded)
    }

    /// Idempotent teardown: broadcasts `Dispose` while the body is still readable,
    /// then nulls body and owner. Does not remove the document from its
    /// collection's list; the collection is either already tearing down or the
    /// removal happened through `remove_item`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(ReferenceAction::Dispose);
        *self.body.write() = None;
        *self.collection.write() = None;
        self.changed.clear();
    }
}

impl ReferenceNode for DocumentReference {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Two wrappers are the same document iff they share the owning collection
/// instance and the store identifier. Separate in-memory collections may wrap the
/// same store record without their documents comparing equal.
impl PartialEq for DocumentReference {
    fn eq(&self, other: &Self) -> bool {
        let owner = self.collection().map(|c| c.instance_id());
        let other_owner = other.collection().map(|c| c.instance_id());
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => owner == other_owner && a == b,
            _ => false,
        }
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "Document({id})"),
            None => write!(f, "Document(<no id>)"),
        }
    }
}

/// Valid store field key: non-empty, no path separator, no reserved prefix.
pub(crate) fn validate_field_name(field: &str) -> Result<(), DocbaseError> {
    if field.is_empty() || field.contains('.') || field.starts_with('$') {
        return Err(DocbaseError::InvalidFieldName(field.to_string()));
    }
    Ok(())
}

/// Shared JSON text rendering for single documents and document arrays.
pub(crate) fn serialize_value(
    value: &Value,
    pretty: bool,
    decoded: bool,
) -> Result<String, DocbaseError> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    if decoded {
        Ok(text)
    } else {
        Ok(escape_non_ascii(&text))
    }
}

/// Escape every non-ASCII character as UTF-16 `\uXXXX` units (surrogate pairs
/// above the BMP). Non-ASCII bytes only occur inside JSON strings, so a blanket
/// pass over the serialized text is safe.
fn escape_non_ascii(text: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(text.len());
    let mut units = [0u16; 2];
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04X}", unit);
            }
        }
    }
    out
}
