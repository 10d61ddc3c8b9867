//! Entity contract implemented by every persisted record type.
//!
//! The lifecycle hooks are sealed: only the types of this crate's model can
//! be managed, because cascade and ownership rules are specific to them.

use crate::model::child::Child;
use crate::model::parent::Parent;
use crate::persistence::entity_ref::EntityRef;
use crate::persistence::error::PersistResult;
use crate::persistence::manager::EntityManager;
use crate::persistence::mapping;
use rusqlite::Connection;
use std::fmt::Debug;

/// Storage identity shared by all entity tables.
pub type EntityId = i64;

/// A record type the entity manager can persist, merge, find and remove.
pub trait Entity: Clone + PartialEq + Debug + 'static + sealed::Lifecycle {
    /// Backing table name.
    const TABLE: &'static str;

    fn id(&self) -> Option<EntityId>;
}

pub(crate) mod sealed {
    use super::*;

    /// Type-specific lifecycle dispatch used by the generic manager API.
    pub trait Lifecycle: Sized {
        fn persist(em: &EntityManager<'_>, value: Self) -> PersistResult<EntityRef<Self>>;
        fn merge(em: &EntityManager<'_>, value: &Self) -> PersistResult<EntityRef<Self>>;
        fn find(em: &EntityManager<'_>, id: EntityId) -> PersistResult<Option<EntityRef<Self>>>;
        fn refresh(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()>;
        fn remove(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()>;
        fn detach(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool;
        fn contains(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool;
        fn delete_all(em: &EntityManager<'_>) -> PersistResult<usize>;
        fn stored_ids(conn: &Connection) -> PersistResult<Vec<EntityId>>;
    }
}

impl Entity for Parent {
    const TABLE: &'static str = "parent";

    fn id(&self) -> Option<EntityId> {
        self.id
    }
}

impl sealed::Lifecycle for Parent {
    fn persist(em: &EntityManager<'_>, value: Self) -> PersistResult<EntityRef<Self>> {
        em.persist_parent(value)
    }

    fn merge(em: &EntityManager<'_>, value: &Self) -> PersistResult<EntityRef<Self>> {
        em.merge_parent(value)
    }

    fn find(em: &EntityManager<'_>, id: EntityId) -> PersistResult<Option<EntityRef<Self>>> {
        em.find_parent(id)
    }

    fn refresh(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()> {
        em.refresh_parent(handle)
    }

    fn remove(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()> {
        em.remove_parent(handle)
    }

    fn detach(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool {
        em.detach_parent(handle)
    }

    fn contains(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool {
        em.contains_parent(handle)
    }

    fn delete_all(em: &EntityManager<'_>) -> PersistResult<usize> {
        em.delete_all_parents()
    }

    fn stored_ids(conn: &Connection) -> PersistResult<Vec<EntityId>> {
        mapping::list_ids(conn, Self::TABLE)
    }
}

impl Entity for Child {
    const TABLE: &'static str = "child";

    fn id(&self) -> Option<EntityId> {
        self.id
    }
}

impl sealed::Lifecycle for Child {
    fn persist(em: &EntityManager<'_>, value: Self) -> PersistResult<EntityRef<Self>> {
        em.persist_child(value)
    }

    fn merge(em: &EntityManager<'_>, value: &Self) -> PersistResult<EntityRef<Self>> {
        em.merge_child(value)
    }

    fn find(em: &EntityManager<'_>, id: EntityId) -> PersistResult<Option<EntityRef<Self>>> {
        em.find_child(id)
    }

    fn refresh(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()> {
        em.refresh_child(handle)
    }

    fn remove(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> PersistResult<()> {
        em.remove_child(handle)
    }

    fn detach(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool {
        em.detach_child(handle)
    }

    fn contains(em: &EntityManager<'_>, handle: &EntityRef<Self>) -> bool {
        em.contains_child(handle)
    }

    fn delete_all(em: &EntityManager<'_>) -> PersistResult<usize> {
        em.delete_all_children()
    }

    fn stored_ids(conn: &Connection) -> PersistResult<Vec<EntityId>> {
        mapping::list_ids(conn, Self::TABLE)
    }
}
