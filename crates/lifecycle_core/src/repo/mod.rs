//! Repository layer: generic data access per entity type.
//!
//! # Responsibility
//! - Offer a save/find/delete surface without entity-specific queries.
//! - Delegate every guarantee to the entity manager.

pub mod crud_repo;
