//! Persistence context: identity maps plus last-synced snapshots.
//!
//! # Invariants
//! - Every tracked handle is attached; removal from a map detaches it.
//! - `snapshot` mirrors what storage holds for the entity after the last
//!   successful write, and is what `flush` diffs against.
//! - A child id is tracked at most once: either standalone in `children` or
//!   as an element of one tracked parent's collection.

use crate::model::child::{Child, ChildId};
use crate::model::parent::{Parent, ParentId};
use crate::persistence::entity::{Entity, EntityId};
use crate::persistence::entity_ref::EntityRef;
use std::collections::BTreeMap;

pub struct Tracked<E> {
    pub handle: EntityRef<E>,
    pub snapshot: E,
}

/// Identity map for one entity type, ordered by id for deterministic flushes.
pub struct IdentityMap<E> {
    entries: BTreeMap<EntityId, Tracked<E>>,
}

impl<E: Entity> IdentityMap<E> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&Tracked<E>> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Tracked<E>> {
        self.entries.get_mut(&id)
    }

    pub fn contains_id(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns whether this exact handle is the tracked instance for its id.
    pub fn contains_handle(&self, handle: &EntityRef<E>) -> bool {
        handle
            .id()
            .and_then(|id| self.entries.get(&id))
            .is_some_and(|tracked| tracked.handle.ptr_eq(handle))
    }

    pub fn register(&mut self, id: EntityId, handle: EntityRef<E>, snapshot: E) {
        if let Some(previous) = self.entries.insert(id, Tracked { handle, snapshot }) {
            previous.handle.mark_detached();
        }
    }

    /// Stops tracking `id`; the removed handle becomes detached.
    pub fn remove(&mut self, id: EntityId) -> Option<Tracked<E>> {
        let tracked = self.entries.remove(&id)?;
        tracked.handle.mark_detached();
        Some(tracked)
    }

    pub fn detach_all(&mut self) -> usize {
        let count = self.entries.len();
        for tracked in self.entries.values() {
            tracked.handle.mark_detached();
        }
        self.entries.clear();
        count
    }

    /// Detaches every entry whose handle is not one of `keep`.
    pub fn detach_unless(&mut self, keep: &[EntityRef<E>]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, tracked| {
            let kept = keep.iter().any(|handle| handle.ptr_eq(&tracked.handle));
            if !kept {
                tracked.handle.mark_detached();
            }
            kept
        });
        before - self.entries.len()
    }

    fn handles(&self) -> Vec<EntityRef<E>> {
        self.entries
            .values()
            .map(|tracked| tracked.handle.clone())
            .collect()
    }

    fn borrowed_id(&self) -> Option<EntityId> {
        self.entries
            .iter()
            .find(|(_, tracked)| tracked.handle.is_borrowed())
            .map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Tracked<E>)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&EntityId, &mut Tracked<E>)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handles tracked at one point in time; see [`PersistenceContext::mark`].
pub struct ContextMark {
    parents: Vec<EntityRef<Parent>>,
    children: Vec<EntityRef<Child>>,
}

pub struct PersistenceContext {
    pub parents: IdentityMap<Parent>,
    pub children: IdentityMap<Child>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self {
            parents: IdentityMap::new(),
            children: IdentityMap::new(),
        }
    }

    /// Returns the tracked parent whose collection holds `child_id`.
    pub fn owner_of(&self, child_id: ChildId) -> Option<ParentId> {
        self.parents.iter().find_map(|(parent_id, tracked)| {
            tracked
                .handle
                .read()
                .children
                .iter()
                .any(|child| child.id == Some(child_id))
                .then_some(*parent_id)
        })
    }

    /// Current state of a child tracked as an element of a parent collection.
    pub fn owned_child(&self, child_id: ChildId) -> Option<Child> {
        self.parents.iter().find_map(|(_, tracked)| {
            tracked
                .handle
                .read()
                .children
                .iter()
                .find(|child| child.id == Some(child_id))
                .cloned()
        })
    }

    /// Returns whether `child_id` is tracked either standalone or as an
    /// element of a tracked parent.
    pub fn is_child_managed(&self, child_id: ChildId) -> bool {
        self.children.contains_id(child_id) || self.owner_of(child_id).is_some()
    }

    /// Releases every tracked representation of `child_id` so that a new
    /// owner can claim it.
    ///
    /// The child is dropped from other parents' collections and snapshots
    /// alike, so no orphaning write is issued for it on the next flush.
    pub fn release_child(&mut self, child_id: ChildId, new_owner: Option<ParentId>) {
        self.children.remove(child_id);
        for (parent_id, tracked) in self.parents.iter_mut() {
            if Some(*parent_id) == new_owner {
                continue;
            }
            tracked
                .handle
                .write()
                .children
                .retain(|child| child.id != Some(child_id));
            tracked
                .snapshot
                .children
                .retain(|child| child.id != Some(child_id));
        }
    }

    /// Detaches every tracked entity.
    pub fn clear(&mut self) -> usize {
        self.parents.detach_all() + self.children.detach_all()
    }

    /// Records the handles tracked right now.
    pub fn mark(&self) -> ContextMark {
        ContextMark {
            parents: self.parents.handles(),
            children: self.children.handles(),
        }
    }

    /// Detaches what was registered after `mark` was taken.
    pub fn clear_since(&mut self, mark: &ContextMark) -> usize {
        self.parents.detach_unless(&mark.parents) + self.children.detach_unless(&mark.children)
    }

    /// First tracked entity currently borrowed through its handle.
    pub fn borrowed_entity(&self) -> Option<(&'static str, EntityId)> {
        self.parents
            .borrowed_id()
            .map(|id| (Parent::TABLE, id))
            .or_else(|| self.children.borrowed_id().map(|id| (Child::TABLE, id)))
    }

    pub fn len(&self) -> usize {
        self.parents.len() + self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::PersistenceContext;
    use crate::model::child::Child;
    use crate::model::parent::Parent;
    use crate::persistence::entity_ref::EntityRef;

    fn tracked_parent(ctx: &mut PersistenceContext, id: i64, child_ids: &[i64]) -> EntityRef<Parent> {
        let mut parent = Parent::builder().id(id).name(format!("p{id}")).build();
        for child_id in child_ids {
            parent.add_child(Child::builder().id(*child_id).name(format!("c{child_id}")).build());
        }
        let handle = EntityRef::attached(parent.clone());
        ctx.parents.register(id, handle.clone(), parent);
        handle
    }

    #[test]
    fn owner_of_finds_collection_holder() {
        let mut ctx = PersistenceContext::new();
        tracked_parent(&mut ctx, 1, &[10, 11]);
        tracked_parent(&mut ctx, 2, &[12]);

        assert_eq!(ctx.owner_of(11), Some(1));
        assert_eq!(ctx.owner_of(12), Some(2));
        assert_eq!(ctx.owner_of(99), None);
        assert!(ctx.is_child_managed(10));
    }

    #[test]
    fn release_child_removes_it_from_previous_owner_and_snapshot() {
        let mut ctx = PersistenceContext::new();
        let first = tracked_parent(&mut ctx, 1, &[10, 11]);
        let standalone = EntityRef::attached(Child::builder().id(10).name("c10").build());
        ctx.children
            .register(10, standalone.clone(), standalone.snapshot());

        ctx.release_child(10, Some(2));

        assert!(!standalone.is_attached());
        assert_eq!(first.read().children.len(), 1);
        let snapshot_ids: Vec<_> = ctx
            .parents
            .get(1)
            .unwrap()
            .snapshot
            .children
            .iter()
            .map(|child| child.id)
            .collect();
        assert_eq!(snapshot_ids, vec![Some(11)]);
    }

    #[test]
    fn clear_since_keeps_entities_tracked_before_the_mark() {
        let mut ctx = PersistenceContext::new();
        let earlier = tracked_parent(&mut ctx, 1, &[]);
        let mark = ctx.mark();
        let later = tracked_parent(&mut ctx, 2, &[]);

        assert_eq!(ctx.clear_since(&mark), 1);
        assert!(earlier.is_attached());
        assert!(!later.is_attached());
        assert!(ctx.parents.contains_handle(&earlier));
    }

    #[test]
    fn borrowed_entity_reports_live_guard() {
        let mut ctx = PersistenceContext::new();
        let parent = tracked_parent(&mut ctx, 3, &[]);

        let guard = parent.read();
        assert_eq!(ctx.borrowed_entity(), Some(("parent", 3)));
        drop(guard);
        assert_eq!(ctx.borrowed_entity(), None);
    }

    #[test]
    fn clear_detaches_everything() {
        let mut ctx = PersistenceContext::new();
        let parent = tracked_parent(&mut ctx, 1, &[]);

        assert_eq!(ctx.clear(), 1);
        assert!(!parent.is_attached());
        assert_eq!(ctx.len(), 0);
    }
}
