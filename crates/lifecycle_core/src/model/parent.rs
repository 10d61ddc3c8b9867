//! Parent entity (aggregate root).

use crate::model::child::{Child, ParentRef};
use serde::{Deserialize, Serialize};

/// Storage-generated identity of a parent row.
pub type ParentId = i64;

/// Aggregate root owning an ordered collection of children.
///
/// Persist and merge cascade to `children`; delete does not. A child dropped
/// from the collection of a managed parent is orphaned on the next flush,
/// not deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    /// `None` until the first successful write, unless supplied by the caller.
    pub id: Option<ParentId>,
    pub name: String,
    #[serde(default)]
    pub children: Vec<Child>,
}

impl Parent {
    /// Starts building a transient parent.
    pub fn builder() -> ParentBuilder {
        ParentBuilder::default()
    }

    /// Creates a transient parent without children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Returns whether this parent has never been assigned an identity.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// Appends a child and points its back reference at this parent.
    pub fn add_child(&mut self, mut child: Child) {
        child.parent = Some(ParentRef::from(&*self));
        self.children.push(child);
    }

    /// Removes and returns the child at `index`, leaving it without a parent.
    pub fn remove_child(&mut self, index: usize) -> Option<Child> {
        if index >= self.children.len() {
            return None;
        }
        let mut child = self.children.remove(index);
        child.parent = None;
        Some(child)
    }
}

/// Builder for [`Parent`].
#[derive(Debug, Clone, Default)]
pub struct ParentBuilder {
    id: Option<ParentId>,
    name: String,
    children: Vec<Child>,
}

impl ParentBuilder {
    pub fn id(mut self, id: ParentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the collection as-is; back references of the given children are
    /// left untouched.
    pub fn children(mut self, children: Vec<Child>) -> Self {
        self.children = children;
        self
    }

    pub fn build(self) -> Parent {
        Parent {
            id: self.id,
            name: self.name,
            children: self.children,
        }
    }
}
