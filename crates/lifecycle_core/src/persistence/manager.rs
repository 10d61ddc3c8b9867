//! Entity manager: persistence context operations over one SQLite connection.
//!
//! # Responsibility
//! - Track managed entities in an identity map and write their changes back.
//! - Apply cascade rules from Parent to its children on persist and merge.
//! - Open, commit and roll back transaction scopes.
//!
//! # Invariants
//! - Inserts happen immediately, so identities are known as soon as `persist`
//!   or `merge` returns. Updates and orphaning are deferred to `flush`.
//! - Every write operation runs under a savepoint; on error storage and the
//!   persistence context are left as they were.
//! - Reads that hit storage flush pending changes first.
//! - Ending a scope (commit or rollback) detaches every managed entity.

use crate::db;
use crate::model::child::{Child, ParentRef};
use crate::model::parent::{Parent, ParentId};
use crate::persistence::context::{ContextMark, PersistenceContext};
use crate::persistence::entity::{Entity, EntityId};
use crate::persistence::entity_ref::EntityRef;
use crate::persistence::error::{PersistError, PersistResult};
use crate::persistence::mapping;
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::cell::RefCell;
use std::time::Instant;
use uuid::Uuid;

const SAVEPOINT_SQL: &str = "SAVEPOINT entity_manager_op;";
const RELEASE_SQL: &str = "RELEASE entity_manager_op;";
const ROLLBACK_SQL: &str = "ROLLBACK TO entity_manager_op; RELEASE entity_manager_op;";

struct Scope<'conn> {
    id: Uuid,
    tx: Transaction<'conn>,
}

/// Unit-of-work manager bound to one migrated connection.
///
/// Without an active scope every operation autocommits; the persistence
/// context still tracks what was persisted, merged or found until `clear`.
/// Repository calls made outside a scope run in a scope of their own and
/// detach only what they loaded or wrote; a failed call detaches everything.
pub struct EntityManager<'conn> {
    conn: &'conn Connection,
    context: RefCell<PersistenceContext>,
    scope: RefCell<Option<Scope<'conn>>>,
}

#[derive(Default)]
struct FlushOutcome {
    inserted: Vec<(ParentId, usize, EntityId)>,
    absorbed: Vec<EntityId>,
    /// `(owner, child)` pairs whose back reference now points elsewhere.
    moved_out: Vec<(ParentId, EntityId)>,
    parents_updated: usize,
    children_updated: usize,
    children_orphaned: usize,
}

enum MergeTarget<E> {
    Managed { handle: EntityRef<E>, snapshot: E },
    Stored(E),
    Absent,
}

impl<'conn> EntityManager<'conn> {
    /// Creates an entity manager over a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> PersistResult<Self> {
        mapping::ensure_connection_ready(conn)?;
        Ok(Self {
            conn,
            context: RefCell::new(PersistenceContext::new()),
            scope: RefCell::new(None),
        })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    // Transaction scopes

    /// Opens a transaction scope and returns its correlation id.
    pub fn begin(&self) -> PersistResult<Uuid> {
        let mut scope = self.scope.borrow_mut();
        if scope.is_some() {
            return reject("scope_begin", PersistError::TransactionAlreadyActive);
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let id = Uuid::new_v4();
        *scope = Some(Scope { id, tx });
        info!("event=scope_begin module=persistence status=ok scope_id={id}");
        Ok(id)
    }

    /// Flushes, commits and ends the active scope.
    ///
    /// A failed flush keeps the scope open so the caller can roll back.
    pub fn commit(&self) -> PersistResult<()> {
        self.commit_detaching(None)
    }

    /// Opens a scope for a single repository call and marks what is tracked
    /// before it.
    pub(crate) fn begin_scoped_call(&self) -> PersistResult<ContextMark> {
        self.begin()?;
        Ok(self.context.borrow().mark())
    }

    /// Commits a scope opened by `begin_scoped_call`, detaching only the
    /// entities registered during the call.
    pub(crate) fn commit_scoped_call(&self, mark: &ContextMark) -> PersistResult<()> {
        self.commit_detaching(Some(mark))
    }

    fn commit_detaching(&self, kept: Option<&ContextMark>) -> PersistResult<()> {
        if !self.in_transaction() {
            return reject("scope_commit", PersistError::NoActiveTransaction);
        }
        self.flush()?;

        let Some(scope) = self.scope.borrow_mut().take() else {
            return reject("scope_commit", PersistError::NoActiveTransaction);
        };
        let scope_id = scope.id;
        let committed = scope.tx.commit();
        let detached = {
            let mut ctx = self.context.borrow_mut();
            match (&committed, kept) {
                (Ok(()), Some(mark)) => ctx.clear_since(mark),
                _ => ctx.clear(),
            }
        };
        if let Err(err) = committed {
            let err = PersistError::from(err);
            warn!(
                "event=scope_commit module=persistence status=error scope_id={} error_code={} error={}",
                scope_id,
                err.code(),
                err
            );
            return Err(err);
        }

        info!(
            "event=scope_commit module=persistence status=ok scope_id={scope_id} detached={detached}"
        );
        Ok(())
    }

    /// Rolls back and ends the active scope; unflushed changes are discarded.
    pub fn rollback(&self) -> PersistResult<()> {
        let Some(scope) = self.scope.borrow_mut().take() else {
            return reject("scope_rollback", PersistError::NoActiveTransaction);
        };
        let scope_id = scope.id;
        let rolled_back = scope.tx.rollback();
        let detached = self.context.borrow_mut().clear();
        rolled_back?;

        info!(
            "event=scope_rollback module=persistence status=ok scope_id={scope_id} detached={detached}"
        );
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.scope.borrow().is_some()
    }

    pub fn scope_id(&self) -> Option<Uuid> {
        self.scope.borrow().as_ref().map(|scope| scope.id)
    }

    // Generic entity operations

    /// Makes a transient entity managed, inserting it immediately.
    ///
    /// # Errors
    /// - `EntityExists` when the supplied id is already managed or stored.
    /// - `TransientReference` when a child points at an unsaved parent.
    pub fn persist<E: Entity>(&self, entity: E) -> PersistResult<EntityRef<E>> {
        E::persist(self, entity)
    }

    /// Copies `entity` into a managed instance and returns that instance.
    ///
    /// The argument itself never becomes managed.
    pub fn merge<E: Entity>(&self, entity: &E) -> PersistResult<EntityRef<E>> {
        E::merge(self, entity)
    }

    /// Returns the managed instance for `id`, loading it when needed.
    pub fn find<E: Entity>(&self, id: EntityId) -> PersistResult<Option<EntityRef<E>>> {
        E::find(self, id)
    }

    pub fn find_all<E: Entity>(&self) -> PersistResult<Vec<EntityRef<E>>> {
        self.flush()?;
        let mut found = Vec::new();
        for id in E::stored_ids(self.conn)? {
            if let Some(handle) = self.find::<E>(id)? {
                found.push(handle);
            }
        }
        Ok(found)
    }

    pub fn exists<E: Entity>(&self, id: EntityId) -> PersistResult<bool> {
        self.flush()?;
        mapping::row_exists(self.conn, E::TABLE, id)
    }

    pub fn count<E: Entity>(&self) -> PersistResult<u64> {
        self.flush()?;
        mapping::count_rows(self.conn, E::TABLE)
    }

    /// Reloads a managed entity, discarding its unflushed changes.
    pub fn refresh<E: Entity>(&self, handle: &EntityRef<E>) -> PersistResult<()> {
        E::refresh(self, handle)
    }

    /// Deletes the row of a managed entity and detaches its handle.
    ///
    /// Children are never deleted with their parent.
    pub fn remove<E: Entity>(&self, handle: &EntityRef<E>) -> PersistResult<()> {
        E::remove(self, handle)
    }

    /// Deletes every row of `E` and detaches its managed instances.
    pub fn delete_all<E: Entity>(&self) -> PersistResult<usize> {
        E::delete_all(self)
    }

    /// Stops tracking `handle`. Returns `false` when it was not managed here.
    pub fn detach<E: Entity>(&self, handle: &EntityRef<E>) -> bool {
        E::detach(self, handle)
    }

    pub fn contains<E: Entity>(&self, handle: &EntityRef<E>) -> bool {
        E::contains(self, handle)
    }

    /// Detaches every managed entity without writing pending changes.
    pub fn clear(&self) -> usize {
        let detached = self.context.borrow_mut().clear();
        debug!("event=clear module=persistence status=ok detached={detached}");
        detached
    }

    pub fn managed_count(&self) -> usize {
        self.context.borrow().len()
    }

    /// Restarts identity generation for both entity tables.
    pub fn restart_identities(&self) -> PersistResult<()> {
        db::restart_identities(self.conn)?;
        Ok(())
    }

    /// Writes every change of managed entities since their last sync.
    ///
    /// # Errors
    /// - `EntityBorrowed` when a managed handle still has a live guard.
    pub fn flush(&self) -> PersistResult<()> {
        let started_at = Instant::now();
        let borrowed = self.context.borrow().borrowed_entity();
        if let Some((table, id)) = borrowed {
            return reject("flush", PersistError::EntityBorrowed { table, id });
        }
        let outcome = {
            let ctx = self.context.borrow();
            self.atomically("flush", |conn| write_changes(conn, &ctx))?
        };

        let mut ctx = self.context.borrow_mut();
        for (parent_id, index, child_id) in &outcome.inserted {
            if let Some(tracked) = ctx.parents.get(*parent_id) {
                let mut current = tracked.handle.write();
                let owner_ref = ParentRef::to_id(*parent_id, current.name.as_str());
                if let Some(child) = current.children.get_mut(*index) {
                    child.id = Some(*child_id);
                    if child.parent_id().is_none() {
                        child.parent = Some(owner_ref);
                    }
                }
            }
        }
        for child_id in &outcome.absorbed {
            ctx.children.remove(*child_id);
        }
        // A child whose back reference left its owner stays managed on its
        // own, tracked standalone from now on.
        let mut moved = Vec::new();
        for (owner_id, child_id) in &outcome.moved_out {
            if let Some(tracked) = ctx.parents.get_mut(*owner_id) {
                let mut current = tracked.handle.write();
                if let Some(index) = current
                    .children
                    .iter()
                    .position(|child| child.id == Some(*child_id))
                {
                    moved.push(current.children.remove(index));
                }
            }
        }
        for child in moved {
            if let Some(child_id) = child.id {
                ctx.children
                    .register(child_id, EntityRef::attached(child.clone()), child);
            }
        }
        for (_, tracked) in ctx.parents.iter_mut() {
            tracked.snapshot = tracked.handle.snapshot();
        }
        for (_, tracked) in ctx.children.iter_mut() {
            tracked.snapshot = tracked.handle.snapshot();
        }

        let touched = outcome.parents_updated
            + outcome.inserted.len()
            + outcome.children_updated
            + outcome.children_orphaned;
        if touched > 0 {
            info!(
                "event=flush module=persistence status=ok scope_id={} parents_updated={} children_inserted={} children_updated={} children_orphaned={} children_moved={} duration_ms={}",
                self.scope_label(),
                outcome.parents_updated,
                outcome.inserted.len(),
                outcome.children_updated,
                outcome.children_orphaned,
                outcome.moved_out.len(),
                started_at.elapsed().as_millis()
            );
        }
        Ok(())
    }

    // Parent lifecycle

    pub(crate) fn persist_parent(&self, mut parent: Parent) -> PersistResult<EntityRef<Parent>> {
        if let Some(id) = parent.id {
            if self.context.borrow().parents.contains_id(id)
                || mapping::row_exists(self.conn, Parent::TABLE, id)?
            {
                return reject(
                    "persist",
                    PersistError::EntityExists {
                        table: Parent::TABLE,
                        id,
                    },
                );
            }
        }

        let mut claimed = Vec::new();
        for child in &parent.children {
            let Some(child_id) = child.id else {
                continue;
            };
            if self.context.borrow().is_child_managed(child_id) {
                claimed.push(child_id);
            } else if mapping::row_exists(self.conn, Child::TABLE, child_id)? {
                return reject(
                    "persist",
                    PersistError::EntityExists {
                        table: Child::TABLE,
                        id: child_id,
                    },
                );
            }
        }

        let (id, parent) = self.atomically("persist", |conn| {
            let id = mapping::insert_parent(conn, parent.id, &parent.name)?;
            parent.id = Some(id);
            let back_ref = ParentRef::to_id(id, parent.name.as_str());
            for child in parent.children.iter_mut() {
                match child.id {
                    Some(child_id) if claimed.contains(&child_id) => {
                        let changed = mapping::update_child(conn, child_id, &child.name, Some(id))?;
                        expect_changed(changed, Child::TABLE, child_id)?;
                    }
                    Some(child_id) => {
                        mapping::insert_child(conn, Some(child_id), &child.name, Some(id))?;
                    }
                    None => {
                        child.id = Some(mapping::insert_child(conn, None, &child.name, Some(id))?);
                    }
                }
                child.parent = Some(back_ref.clone());
            }
            Ok((id, parent))
        })?;

        let children = parent.children.len();
        let handle = EntityRef::attached(parent.clone());
        {
            let mut ctx = self.context.borrow_mut();
            for child_id in &claimed {
                ctx.release_child(*child_id, None);
            }
            ctx.parents.register(id, handle.clone(), parent);
        }

        info!(
            "event=persist module=persistence status=ok scope_id={} entity=parent id={} children={} claimed={}",
            self.scope_label(),
            id,
            children,
            claimed.len()
        );
        Ok(handle)
    }

    pub(crate) fn merge_parent(&self, detached: &Parent) -> PersistResult<EntityRef<Parent>> {
        let target = self.parent_merge_target(detached.id)?;

        let mut claimed = Vec::new();
        for child in &detached.children {
            let Some(child_id) = child.id else {
                continue;
            };
            if self.context.borrow().is_child_managed(child_id)
                || mapping::row_exists(self.conn, Child::TABLE, child_id)?
            {
                claimed.push(child_id);
            }
        }

        let mut merged = detached.clone();
        let (id, snapshot) = self.atomically("merge", |conn| {
            let (id, mut snapshot) = match &target {
                MergeTarget::Managed { snapshot, .. } => (merged.id, snapshot.clone()),
                MergeTarget::Stored(stored) => (stored.id, stored.clone()),
                MergeTarget::Absent => {
                    let id = mapping::insert_parent(conn, merged.id, &merged.name)?;
                    (Some(id), Parent::builder().id(id).name(merged.name.as_str()).build())
                }
            };
            let id = id.ok_or_else(|| {
                PersistError::InvalidData("merge target parent has no identity".to_string())
            })?;

            merged.id = Some(id);
            let back_ref = ParentRef::to_id(id, merged.name.as_str());
            for child in merged.children.iter_mut() {
                child.parent = Some(back_ref.clone());
                if child.id.is_some_and(|child_id| claimed.contains(&child_id)) {
                    continue;
                }
                child.id = Some(mapping::insert_child(conn, child.id, &child.name, Some(id))?);
                snapshot.children.push(child.clone());
            }
            Ok((id, snapshot))
        })?;

        let children = merged.children.len();
        let mut ctx = self.context.borrow_mut();
        for child_id in &claimed {
            ctx.release_child(*child_id, Some(id));
        }
        let handle = match target {
            MergeTarget::Managed { handle, .. } => {
                handle.replace(merged);
                if let Some(tracked) = ctx.parents.get_mut(id) {
                    tracked.snapshot = snapshot;
                }
                handle
            }
            MergeTarget::Stored(_) | MergeTarget::Absent => {
                let handle = EntityRef::attached(merged);
                ctx.parents.register(id, handle.clone(), snapshot);
                handle
            }
        };
        drop(ctx);

        info!(
            "event=merge module=persistence status=ok scope_id={} entity=parent id={} children={} claimed={}",
            self.scope_label(),
            id,
            children,
            claimed.len()
        );
        Ok(handle)
    }

    fn parent_merge_target(&self, id: Option<ParentId>) -> PersistResult<MergeTarget<Parent>> {
        let Some(id) = id else {
            return Ok(MergeTarget::Absent);
        };
        let managed = self.context.borrow().parents.get(id).map(|tracked| {
            MergeTarget::Managed {
                handle: tracked.handle.clone(),
                snapshot: tracked.snapshot.clone(),
            }
        });
        if let Some(target) = managed {
            return Ok(target);
        }

        self.flush()?;
        Ok(match mapping::load_parent(self.conn, id)? {
            Some(stored) => MergeTarget::Stored(stored),
            None => MergeTarget::Absent,
        })
    }

    pub(crate) fn find_parent(&self, id: ParentId) -> PersistResult<Option<EntityRef<Parent>>> {
        if let Some(tracked) = self.context.borrow().parents.get(id) {
            return Ok(Some(tracked.handle.clone()));
        }

        self.flush()?;
        let Some(stored) = mapping::load_parent(self.conn, id)? else {
            return Ok(None);
        };

        let handle = EntityRef::attached(stored.clone());
        let mut ctx = self.context.borrow_mut();
        for child in &stored.children {
            if let Some(child_id) = child.id {
                ctx.children.remove(child_id);
            }
        }
        ctx.parents.register(id, handle.clone(), stored);
        debug!("event=find module=persistence status=ok entity=parent id={id} source=storage");
        Ok(Some(handle))
    }

    pub(crate) fn refresh_parent(&self, handle: &EntityRef<Parent>) -> PersistResult<()> {
        let id = self.managed_parent_id(handle, "refresh")?;
        let Some(stored) = mapping::load_parent(self.conn, id)? else {
            self.context.borrow_mut().parents.remove(id);
            return reject(
                "refresh",
                PersistError::EntityNotFound {
                    table: Parent::TABLE,
                    id,
                },
            );
        };

        let mut ctx = self.context.borrow_mut();
        for child in &stored.children {
            if let Some(child_id) = child.id {
                ctx.release_child(child_id, Some(id));
            }
        }
        handle.replace(stored.clone());
        if let Some(tracked) = ctx.parents.get_mut(id) {
            tracked.snapshot = stored;
        }
        debug!("event=refresh module=persistence status=ok entity=parent id={id}");
        Ok(())
    }

    pub(crate) fn remove_parent(&self, handle: &EntityRef<Parent>) -> PersistResult<()> {
        let id = self.managed_parent_id(handle, "remove")?;
        self.atomically("remove", |conn| {
            let changed = mapping::delete_row(conn, Parent::TABLE, id)?;
            expect_changed(changed, Parent::TABLE, id)
        })?;

        self.context.borrow_mut().parents.remove(id);
        info!(
            "event=remove module=persistence status=ok scope_id={} entity=parent id={}",
            self.scope_label(),
            id
        );
        Ok(())
    }

    pub(crate) fn detach_parent(&self, handle: &EntityRef<Parent>) -> bool {
        let mut ctx = self.context.borrow_mut();
        if !ctx.parents.contains_handle(handle) {
            return false;
        }
        let Some(id) = handle.id() else {
            return false;
        };
        ctx.parents.remove(id);
        debug!("event=detach module=persistence status=ok entity=parent id={id}");
        true
    }

    pub(crate) fn contains_parent(&self, handle: &EntityRef<Parent>) -> bool {
        self.context.borrow().parents.contains_handle(handle)
    }

    pub(crate) fn delete_all_parents(&self) -> PersistResult<usize> {
        self.flush()?;
        let deleted = self.atomically("delete_all", |conn| {
            mapping::delete_all_rows(conn, Parent::TABLE)
        })?;

        let detached = self.context.borrow_mut().parents.detach_all();
        info!(
            "event=delete_all module=persistence status=ok entity=parent deleted={deleted} detached={detached}"
        );
        Ok(deleted)
    }

    fn managed_parent_id(
        &self,
        handle: &EntityRef<Parent>,
        event: &'static str,
    ) -> PersistResult<ParentId> {
        match handle.id() {
            Some(id) if self.context.borrow().parents.contains_handle(handle) => Ok(id),
            _ => reject(
                event,
                PersistError::NotManaged {
                    table: Parent::TABLE,
                },
            ),
        }
    }

    // Child lifecycle

    pub(crate) fn persist_child(&self, mut child: Child) -> PersistResult<EntityRef<Child>> {
        if let Some(id) = child.id {
            if self.context.borrow().is_child_managed(id)
                || mapping::row_exists(self.conn, Child::TABLE, id)?
            {
                return reject(
                    "persist",
                    PersistError::EntityExists {
                        table: Child::TABLE,
                        id,
                    },
                );
            }
        }
        let parent_id = match foreign_key(&child) {
            Ok(parent_id) => parent_id,
            Err(err) => return reject("persist", err),
        };

        let (id, child) = self.atomically("persist", |conn| {
            let id = mapping::insert_child(conn, child.id, &child.name, parent_id)?;
            child.id = Some(id);
            Ok((id, child))
        })?;

        let handle = EntityRef::attached(child.clone());
        self.context
            .borrow_mut()
            .children
            .register(id, handle.clone(), child);
        info!(
            "event=persist module=persistence status=ok scope_id={} entity=child id={} parent_id={}",
            self.scope_label(),
            id,
            format_parent_id(parent_id)
        );
        Ok(handle)
    }

    pub(crate) fn merge_child(&self, detached: &Child) -> PersistResult<EntityRef<Child>> {
        let parent_id = match foreign_key(detached) {
            Ok(parent_id) => parent_id,
            Err(err) => return reject("merge", err),
        };
        let target = self.child_merge_target(detached.id)?;

        let mut merged = detached.clone();
        let (id, snapshot) = self.atomically("merge", |conn| match &target {
            MergeTarget::Managed { snapshot, .. } => merged
                .id
                .map(|id| (id, snapshot.clone()))
                .ok_or_else(|| {
                    PersistError::InvalidData("merge target child has no identity".to_string())
                }),
            MergeTarget::Stored(stored) => stored
                .id
                .map(|id| (id, stored.clone()))
                .ok_or_else(|| {
                    PersistError::InvalidData("stored child has no identity".to_string())
                }),
            MergeTarget::Absent => {
                let id = mapping::insert_child(conn, merged.id, &merged.name, parent_id)?;
                merged.id = Some(id);
                Ok((id, merged.clone()))
            }
        })?;

        let mut ctx = self.context.borrow_mut();
        let handle = match target {
            MergeTarget::Managed { handle, .. } => {
                handle.replace(merged);
                if let Some(tracked) = ctx.children.get_mut(id) {
                    tracked.snapshot = snapshot;
                }
                handle
            }
            MergeTarget::Stored(_) | MergeTarget::Absent => {
                let handle = EntityRef::attached(merged);
                ctx.children.register(id, handle.clone(), snapshot);
                handle
            }
        };
        drop(ctx);

        info!(
            "event=merge module=persistence status=ok scope_id={} entity=child id={} parent_id={}",
            self.scope_label(),
            id,
            format_parent_id(parent_id)
        );
        Ok(handle)
    }

    fn child_merge_target(&self, id: Option<EntityId>) -> PersistResult<MergeTarget<Child>> {
        let Some(id) = id else {
            return Ok(MergeTarget::Absent);
        };
        let managed = self.context.borrow().children.get(id).map(|tracked| {
            MergeTarget::Managed {
                handle: tracked.handle.clone(),
                snapshot: tracked.snapshot.clone(),
            }
        });
        if let Some(target) = managed {
            return Ok(target);
        }

        // A child merged on its own leaves any aggregate that held it; its
        // back reference decides the foreign key from now on.
        self.flush()?;
        self.context.borrow_mut().release_child(id, None);
        Ok(match mapping::load_child(self.conn, id)? {
            Some(stored) => MergeTarget::Stored(stored),
            None => MergeTarget::Absent,
        })
    }

    pub(crate) fn find_child(&self, id: EntityId) -> PersistResult<Option<EntityRef<Child>>> {
        {
            let ctx = self.context.borrow();
            if let Some(tracked) = ctx.children.get(id) {
                return Ok(Some(tracked.handle.clone()));
            }
            if let Some(owned) = ctx.owned_child(id) {
                return Ok(Some(EntityRef::detached(owned)));
            }
        }

        self.flush()?;
        let Some(stored) = mapping::load_child(self.conn, id)? else {
            return Ok(None);
        };

        let handle = EntityRef::attached(stored.clone());
        self.context
            .borrow_mut()
            .children
            .register(id, handle.clone(), stored);
        debug!("event=find module=persistence status=ok entity=child id={id} source=storage");
        Ok(Some(handle))
    }

    pub(crate) fn refresh_child(&self, handle: &EntityRef<Child>) -> PersistResult<()> {
        let id = self.managed_child_id(handle, "refresh")?;
        let Some(stored) = mapping::load_child(self.conn, id)? else {
            self.context.borrow_mut().children.remove(id);
            return reject(
                "refresh",
                PersistError::EntityNotFound {
                    table: Child::TABLE,
                    id,
                },
            );
        };

        handle.replace(stored.clone());
        if let Some(tracked) = self.context.borrow_mut().children.get_mut(id) {
            tracked.snapshot = stored;
        }
        debug!("event=refresh module=persistence status=ok entity=child id={id}");
        Ok(())
    }

    /// Removes a standalone managed child, or a child owned by a managed
    /// parent (the copy handed out by `find`). An owned child also leaves its
    /// parent's collection.
    pub(crate) fn remove_child(&self, handle: &EntityRef<Child>) -> PersistResult<()> {
        let id = self.removable_child_id(handle)?;
        self.atomically("remove", |conn| {
            let changed = mapping::delete_row(conn, Child::TABLE, id)?;
            expect_changed(changed, Child::TABLE, id)
        })?;

        self.context.borrow_mut().release_child(id, None);
        handle.mark_detached();
        info!(
            "event=remove module=persistence status=ok scope_id={} entity=child id={}",
            self.scope_label(),
            id
        );
        Ok(())
    }

    pub(crate) fn detach_child(&self, handle: &EntityRef<Child>) -> bool {
        let mut ctx = self.context.borrow_mut();
        if !ctx.children.contains_handle(handle) {
            return false;
        }
        let Some(id) = handle.id() else {
            return false;
        };
        ctx.children.remove(id);
        debug!("event=detach module=persistence status=ok entity=child id={id}");
        true
    }

    pub(crate) fn contains_child(&self, handle: &EntityRef<Child>) -> bool {
        self.context.borrow().children.contains_handle(handle)
    }

    pub(crate) fn delete_all_children(&self) -> PersistResult<usize> {
        self.flush()?;
        let deleted = self.atomically("delete_all", |conn| {
            mapping::delete_all_rows(conn, Child::TABLE)
        })?;

        let mut ctx = self.context.borrow_mut();
        let detached = ctx.children.detach_all();
        for (_, tracked) in ctx.parents.iter_mut() {
            tracked.handle.write().children.clear();
            tracked.snapshot.children.clear();
        }
        drop(ctx);

        info!(
            "event=delete_all module=persistence status=ok entity=child deleted={deleted} detached={detached}"
        );
        Ok(deleted)
    }

    fn removable_child_id(&self, handle: &EntityRef<Child>) -> PersistResult<EntityId> {
        let ctx = self.context.borrow();
        match handle.id() {
            Some(id)
                if ctx.children.contains_handle(handle)
                    || (!ctx.children.contains_id(id) && ctx.owner_of(id).is_some()) =>
            {
                Ok(id)
            }
            _ => reject(
                "remove",
                PersistError::NotManaged {
                    table: Child::TABLE,
                },
            ),
        }
    }

    fn managed_child_id(
        &self,
        handle: &EntityRef<Child>,
        event: &'static str,
    ) -> PersistResult<EntityId> {
        match handle.id() {
            Some(id) if self.context.borrow().children.contains_handle(handle) => Ok(id),
            _ => reject(
                event,
                PersistError::NotManaged {
                    table: Child::TABLE,
                },
            ),
        }
    }

    // Internals

    fn atomically<T>(
        &self,
        event: &'static str,
        op: impl FnOnce(&Connection) -> PersistResult<T>,
    ) -> PersistResult<T> {
        self.conn.execute_batch(SAVEPOINT_SQL)?;
        match op(self.conn) {
            Ok(value) => {
                self.conn.execute_batch(RELEASE_SQL)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.execute_batch(ROLLBACK_SQL) {
                    error!(
                        "event={event} module=persistence status=error error_code=savepoint_rollback_failed error={rollback_err}"
                    );
                }
                reject(event, err)
            }
        }
    }

    fn scope_label(&self) -> String {
        self.scope_id()
            .map_or_else(|| "none".to_string(), |id| id.to_string())
    }
}

fn write_changes(conn: &Connection, ctx: &PersistenceContext) -> PersistResult<FlushOutcome> {
    let mut outcome = FlushOutcome::default();

    // Orphaning runs first so a child moved between two managed parents ends
    // up with the new owner.
    for (&parent_id, tracked) in ctx.parents.iter() {
        let current = tracked.handle.read();
        if current.id != Some(parent_id) {
            return Err(PersistError::InvalidData(format!(
                "identity of managed parent#{parent_id} was changed to {:?}",
                current.id
            )));
        }
        for previous in &tracked.snapshot.children {
            let Some(child_id) = previous.id else {
                continue;
            };
            if !current.children.iter().any(|child| child.id == Some(child_id)) {
                outcome.children_orphaned += mapping::orphan_child(conn, child_id, parent_id)?;
            }
        }
    }

    for (&parent_id, tracked) in ctx.parents.iter() {
        let current = tracked.handle.read();
        if current.name != tracked.snapshot.name {
            let changed = mapping::update_parent(conn, parent_id, &current.name)?;
            expect_changed(changed, Parent::TABLE, parent_id)?;
            outcome.parents_updated += 1;
        }

        for (index, child) in current.children.iter().enumerate() {
            let Some(child_id) = child.id else {
                let foreign_key = child.parent_id().unwrap_or(parent_id);
                let child_id = mapping::insert_child(conn, None, &child.name, Some(foreign_key))?;
                outcome.inserted.push((parent_id, index, child_id));
                if foreign_key != parent_id {
                    outcome.moved_out.push((parent_id, child_id));
                }
                continue;
            };

            let previous = tracked
                .snapshot
                .children
                .iter()
                .find(|previous| previous.id == Some(child_id));
            // The back reference is the owning side: a changed one wins over
            // collection membership. Elements without one follow the owner.
            let foreign_key = match previous {
                Some(previous) if previous.parent_id() != child.parent_id() => foreign_key(child)?,
                Some(_) => Some(parent_id),
                None => Some(child.parent_id().unwrap_or(parent_id)),
            };
            let unchanged = previous.is_some_and(|previous| previous.name == child.name)
                && foreign_key == Some(parent_id);
            if !unchanged {
                let changed = mapping::update_child(conn, child_id, &child.name, foreign_key)?;
                expect_changed(changed, Child::TABLE, child_id)?;
                outcome.children_updated += 1;
            }
            if foreign_key != Some(parent_id) {
                outcome.moved_out.push((parent_id, child_id));
            }
            if ctx.children.contains_id(child_id) {
                outcome.absorbed.push(child_id);
            }
        }
    }

    for (&child_id, tracked) in ctx.children.iter() {
        if outcome.absorbed.contains(&child_id) {
            continue;
        }
        let current = tracked.handle.read();
        if current.id != Some(child_id) {
            return Err(PersistError::InvalidData(format!(
                "identity of managed child#{child_id} was changed to {:?}",
                current.id
            )));
        }

        let previous = &tracked.snapshot;
        let same_parent = current.parent.as_ref().map(|parent| parent.id)
            == previous.parent.as_ref().map(|parent| parent.id);
        if current.name == previous.name && same_parent {
            continue;
        }

        let parent_id = foreign_key(&current)?;
        let changed = mapping::update_child(conn, child_id, &current.name, parent_id)?;
        expect_changed(changed, Child::TABLE, child_id)?;
        outcome.children_updated += 1;
    }

    Ok(outcome)
}

fn foreign_key(child: &Child) -> PersistResult<Option<ParentId>> {
    match &child.parent {
        None => Ok(None),
        Some(parent) => parent
            .id
            .map(Some)
            .ok_or(PersistError::TransientReference {
                table: Parent::TABLE,
            }),
    }
}

fn expect_changed(changed: usize, table: &'static str, id: EntityId) -> PersistResult<()> {
    if changed == 0 {
        return Err(PersistError::EntityNotFound { table, id });
    }
    Ok(())
}

fn format_parent_id(parent_id: Option<ParentId>) -> String {
    parent_id.map_or_else(|| "null".to_string(), |id| id.to_string())
}

fn reject<T>(event: &'static str, err: PersistError) -> PersistResult<T> {
    warn!(
        "event={} module=persistence status=error error_code={} error={}",
        event,
        err.code(),
        err
    );
    Err(err)
}
