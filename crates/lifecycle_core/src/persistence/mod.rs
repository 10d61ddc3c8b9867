//! Object-relational persistence engine for the Parent/Child model.
//!
//! # Responsibility
//! - Manage entity lifecycle states: transient, managed, detached.
//! - Map entities to rows and keep managed instances in sync with storage.
//!
//! # Invariants
//! - Identity is generated by SQLite unless the caller supplies one.
//! - Parent → children cascades persist and merge, never delete.

pub mod entity;
pub mod entity_ref;
pub mod error;
pub mod manager;

pub(crate) mod context;
mod mapping;
