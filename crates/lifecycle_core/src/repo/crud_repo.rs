//! Generic CRUD repositories over the entity manager.
//!
//! # Responsibility
//! - Expose save/find/delete per entity type without entity-specific queries.
//! - Give every call made outside a transaction scope its own scope.
//!
//! # Invariants
//! - `save` inserts when the entity has no id and merges otherwise; a
//!   supplied id is honoured.
//! - `find_by_id` reports a missing row as `Ok(None)`.
//! - Results of calls made outside a scope are detached on return; entities
//!   the manager tracked before such a call stay managed.

use crate::model::child::Child;
use crate::model::parent::Parent;
use crate::persistence::entity::{Entity, EntityId};
use crate::persistence::entity_ref::EntityRef;
use crate::persistence::error::{PersistError, PersistResult};
use crate::persistence::manager::EntityManager;
use log::warn;
use std::marker::PhantomData;

pub type RepoResult<T> = PersistResult<T>;

/// Repository interface shared by every entity type.
pub trait CrudRepository<E: Entity> {
    fn save(&self, entity: E) -> RepoResult<EntityRef<E>>;
    fn save_all(&self, entities: Vec<E>) -> RepoResult<Vec<EntityRef<E>>>;
    fn find_by_id(&self, id: EntityId) -> RepoResult<Option<EntityRef<E>>>;
    fn exists_by_id(&self, id: EntityId) -> RepoResult<bool>;
    fn find_all(&self) -> RepoResult<Vec<EntityRef<E>>>;
    fn count(&self) -> RepoResult<u64>;
    fn delete(&self, entity: &E) -> RepoResult<()>;
    fn delete_by_id(&self, id: EntityId) -> RepoResult<()>;
    fn delete_all(&self) -> RepoResult<()>;
}

/// Entity-manager backed repository for one entity type.
pub struct EntityRepository<'em, 'conn, E> {
    em: &'em EntityManager<'conn>,
    _entity: PhantomData<E>,
}

/// Repository for [`Parent`]; inherits generic CRUD only.
pub type ParentRepository<'em, 'conn> = EntityRepository<'em, 'conn, Parent>;

/// Repository for [`Child`]; inherits generic CRUD only.
pub type ChildRepository<'em, 'conn> = EntityRepository<'em, 'conn, Child>;

impl<'em, 'conn, E: Entity> EntityRepository<'em, 'conn, E> {
    pub fn new(em: &'em EntityManager<'conn>) -> Self {
        Self {
            em,
            _entity: PhantomData,
        }
    }

    /// Runs `op` inside the active scope, or inside a scope of its own.
    fn in_scope<T>(&self, op: impl FnOnce(&EntityManager<'conn>) -> RepoResult<T>) -> RepoResult<T> {
        if self.em.in_transaction() {
            return op(self.em);
        }

        let mark = self.em.begin_scoped_call()?;
        match op(self.em) {
            Ok(value) => match self.em.commit_scoped_call(&mark) {
                Ok(()) => Ok(value),
                Err(err) => Err(self.abandon(err)),
            },
            Err(err) => Err(self.abandon(err)),
        }
    }

    fn abandon(&self, err: PersistError) -> PersistError {
        if let Err(rollback_err) = self.em.rollback() {
            warn!(
                "event=repository_rollback module=repo status=error entity={} error={}",
                E::TABLE,
                rollback_err
            );
        }
        err
    }
}

impl<E: Entity> CrudRepository<E> for EntityRepository<'_, '_, E> {
    fn save(&self, entity: E) -> RepoResult<EntityRef<E>> {
        self.in_scope(|em| match entity.id() {
            None => em.persist(entity),
            Some(_) => em.merge(&entity),
        })
    }

    fn save_all(&self, entities: Vec<E>) -> RepoResult<Vec<EntityRef<E>>> {
        self.in_scope(|em| {
            entities
                .into_iter()
                .map(|entity| match entity.id() {
                    None => em.persist(entity),
                    Some(_) => em.merge(&entity),
                })
                .collect()
        })
    }

    fn find_by_id(&self, id: EntityId) -> RepoResult<Option<EntityRef<E>>> {
        self.in_scope(|em| em.find::<E>(id))
    }

    fn exists_by_id(&self, id: EntityId) -> RepoResult<bool> {
        self.in_scope(|em| em.exists::<E>(id))
    }

    fn find_all(&self) -> RepoResult<Vec<EntityRef<E>>> {
        self.in_scope(|em| em.find_all::<E>())
    }

    fn count(&self) -> RepoResult<u64> {
        self.in_scope(|em| em.count::<E>())
    }

    /// Deletes the row identified by `entity`; a transient entity is a no-op.
    fn delete(&self, entity: &E) -> RepoResult<()> {
        let Some(id) = entity.id() else {
            return Ok(());
        };
        self.in_scope(|em| match em.find::<E>(id)? {
            Some(handle) => em.remove(&handle),
            None => Ok(()),
        })
    }

    fn delete_by_id(&self, id: EntityId) -> RepoResult<()> {
        self.in_scope(|em| match em.find::<E>(id)? {
            Some(handle) => em.remove(&handle),
            None => Err(PersistError::EntityNotFound { table: E::TABLE, id }),
        })
    }

    fn delete_all(&self) -> RepoResult<()> {
        self.in_scope(|em| em.delete_all::<E>().map(|_| ()))
    }
}
