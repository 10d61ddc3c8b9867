//! Child entity and its back reference to the owning parent.

use crate::model::parent::{Parent, ParentId};
use serde::{Deserialize, Serialize};

/// Storage-generated identity of a child row.
pub type ChildId = i64;

/// Many-to-one back reference from a child to its parent.
///
/// Captures the parent's identity at the time the reference was taken. A
/// reference with `id = None` points at a transient parent and cannot be
/// written as a foreign key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: Option<ParentId>,
    pub name: String,
}

impl ParentRef {
    /// Reference to an already persisted parent.
    pub fn to_id(id: ParentId, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
        }
    }

    /// Returns whether the referenced parent has no identity yet.
    pub fn is_transient(&self) -> bool {
        self.id.is_none()
    }
}

impl From<&Parent> for ParentRef {
    fn from(parent: &Parent) -> Self {
        Self {
            id: parent.id,
            name: parent.name.clone(),
        }
    }
}

/// Child record; owning side of the Parent/Child association.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: Option<ChildId>,
    pub name: String,
    /// Maps to `child.parent_id`. `None` stores a NULL foreign key.
    pub parent: Option<ParentRef>,
}

impl Child {
    pub fn builder() -> ChildBuilder {
        ChildBuilder::default()
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            parent: None,
        }
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// Points this child at `parent`; the change is written on the next flush
    /// when the child is managed.
    pub fn set_parent(&mut self, parent: &Parent) {
        self.parent = Some(ParentRef::from(parent));
    }

    pub fn parent_id(&self) -> Option<ParentId> {
        self.parent.as_ref().and_then(|parent| parent.id)
    }
}

/// Builder for [`Child`].
#[derive(Debug, Clone, Default)]
pub struct ChildBuilder {
    id: Option<ChildId>,
    name: String,
    parent: Option<ParentRef>,
}

impl ChildBuilder {
    pub fn id(mut self, id: ChildId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn parent(mut self, parent: &Parent) -> Self {
        self.parent = Some(ParentRef::from(parent));
        self
    }

    pub fn parent_ref(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> Child {
        Child {
            id: self.id,
            name: self.name,
            parent: self.parent,
        }
    }
}
