//! Node identity shared by every live entity in the reference graph.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier assigned at construction, stable for the node's
/// lifetime and never reused. Two nodes with identical content are still distinct
/// if they were constructed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> InstanceId {
        InstanceId(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        InstanceId::new()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability shared by database, collection, and document references: a stable
/// identity plus a disposal flag. Once disposed, a node rejects further mutation
/// and never re-fires change events.
pub trait ReferenceNode {
    fn instance_id(&self) -> InstanceId;

    fn is_disposed(&self) -> bool;

    /// Identity comparison by `InstanceId`, never by structural content.
    fn reference_equals(&self, other: &dyn ReferenceNode) -> bool {
        self.instance_id() == other.instance_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(InstanceId);

    impl ReferenceNode for Probe {
        fn instance_id(&self) -> InstanceId {
            self.0
        }
        fn is_disposed(&self) -> bool {
            false
        }
    }

    #[test]
    fn instance_ids_never_collide() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn reference_equality_is_by_instance_id() {
        let id = InstanceId::new();
        let a = Probe(id);
        let b = Probe(id);
        let c = Probe(InstanceId::new());
        assert!(a.reference_equals(&b));
        assert!(!a.reference_equals(&c));
    }
}
