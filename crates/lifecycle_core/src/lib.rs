//! Persistence lifecycle core for the Parent/Child aggregate.
//! Entities, the entity manager and generic repositories live here.

pub mod db;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod repo;

pub use db::{open_db, open_db_in_memory, restart_identities, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LogLevel, LoggingError};
pub use model::child::{Child, ChildBuilder, ChildId, ParentRef};
pub use model::parent::{Parent, ParentBuilder, ParentId};
pub use persistence::entity::{Entity, EntityId};
pub use persistence::entity_ref::EntityRef;
pub use persistence::error::{PersistError, PersistResult};
pub use persistence::manager::EntityManager;
pub use repo::crud_repo::{
    ChildRepository, CrudRepository, EntityRepository, ParentRepository, RepoResult,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
