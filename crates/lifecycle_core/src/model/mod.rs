//! Entity model for the Parent/Child association.
//!
//! # Responsibility
//! - Define the record shapes persisted to the `parent` and `child` tables.
//! - Provide builder-style construction for transient entities.
//!
//! # Invariants
//! - `id = None` marks an entity that has never been written.
//! - Parent is the aggregate root; `Child::parent` is the owning side of the
//!   association and maps to `child.parent_id`.

pub mod child;
pub mod parent;
