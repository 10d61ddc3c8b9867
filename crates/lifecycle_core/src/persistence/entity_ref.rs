//! Shared handle to an entity instance tracked by a persistence context.
//!
//! # Invariants
//! - Within one persistence context there is at most one attached handle per
//!   `(table, id)`.
//! - A detached handle keeps its state but is never written by `flush`.

use crate::persistence::entity::{Entity, EntityId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

struct Slot<E> {
    state: RefCell<E>,
    attached: Cell<bool>,
}

/// Handle returned by `persist`, `merge` and `find`.
///
/// Clones share the same instance. Borrow rules follow `RefCell`: do not
/// hold a `read()` guard while calling `write()` on the same handle. A guard
/// held across a call that flushes makes that call fail with
/// `PersistError::EntityBorrowed`.
pub struct EntityRef<E> {
    slot: Rc<Slot<E>>,
}

impl<E: Entity> EntityRef<E> {
    pub(crate) fn attached(value: E) -> Self {
        Self::with_state(value, true)
    }

    pub(crate) fn detached(value: E) -> Self {
        Self::with_state(value, false)
    }

    fn with_state(value: E, attached: bool) -> Self {
        Self {
            slot: Rc::new(Slot {
                state: RefCell::new(value),
                attached: Cell::new(attached),
            }),
        }
    }

    /// Identity of the referenced entity.
    pub fn id(&self) -> Option<EntityId> {
        self.slot.state.borrow().id()
    }

    pub fn read(&self) -> Ref<'_, E> {
        self.slot.state.borrow()
    }

    /// Mutable access; changes reach storage on the next flush only while the
    /// handle is attached.
    pub fn write(&self) -> RefMut<'_, E> {
        self.slot.state.borrow_mut()
    }

    pub fn update(&self, apply: impl FnOnce(&mut E)) {
        apply(&mut *self.slot.state.borrow_mut());
    }

    /// Owned copy of the current state, e.g. for a later `merge`.
    pub fn snapshot(&self) -> E {
        self.slot.state.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.slot.attached.get()
    }

    /// Returns whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    /// Returns whether a `read()` or `write()` guard is currently alive.
    pub(crate) fn is_borrowed(&self) -> bool {
        self.slot.state.try_borrow_mut().is_err()
    }

    pub(crate) fn replace(&self, value: E) {
        *self.slot.state.borrow_mut() = value;
    }

    pub(crate) fn mark_detached(&self) {
        self.slot.attached.set(false);
    }
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<E: Debug> Debug for EntityRef<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.slot.state.try_borrow() {
            Ok(state) => f
                .debug_struct("EntityRef")
                .field("attached", &self.slot.attached.get())
                .field("state", &*state)
                .finish(),
            Err(_) => f
                .debug_struct("EntityRef")
                .field("attached", &self.slot.attached.get())
                .field("state", &"<borrowed>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EntityRef;
    use crate::model::parent::Parent;

    #[test]
    fn clones_share_state() {
        let handle = EntityRef::attached(Parent::builder().id(1).name("a").build());
        let other = handle.clone();

        other.write().name = "b".to_string();

        assert_eq!(handle.read().name, "b");
        assert!(handle.ptr_eq(&other));
    }

    #[test]
    fn is_borrowed_tracks_live_guards() {
        let handle = EntityRef::attached(Parent::builder().id(1).name("a").build());

        let guard = handle.read();
        assert!(handle.is_borrowed());
        drop(guard);

        assert!(!handle.is_borrowed());
    }

    #[test]
    fn detaching_is_visible_through_every_clone() {
        let handle = EntityRef::attached(Parent::builder().id(1).name("a").build());
        let other = handle.clone();

        handle.mark_detached();

        assert!(!other.is_attached());
        assert_eq!(other.id(), Some(1));
    }
}
