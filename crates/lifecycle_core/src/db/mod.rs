//! SQLite storage bootstrap, schema migrations and identity sequences.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the persistence engine.
//! - Apply schema migrations in deterministic order.
//! - Restart identity generation for the `parent`/`child` tables.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Entity storage must not be touched before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod identity;
pub mod migrations;
mod open;

pub use identity::restart_identities;
pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failures while preparing the `parent`/`child` store for the entity manager.
#[derive(Debug)]
pub enum DbError {
    /// Opening the file, setting pragmas, running migration SQL or rewriting
    /// `sqlite_sequence` failed.
    Sqlite(rusqlite::Error),
    /// The store was written by a newer schema than this build migrates to;
    /// opening it would risk mapping rows to the wrong entity shape.
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

impl DbError {
    /// Stable code for `error_code=` log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite_failure",
            Self::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "entity store error: {err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "entity store schema version {db_version} is newer than supported {latest_supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

#[cfg(test)]
mod tests {
    use super::DbError;

    #[test]
    fn newer_schema_names_both_versions() {
        let err = DbError::UnsupportedSchemaVersion {
            db_version: 9,
            latest_supported: 1,
        };

        assert_eq!(err.code(), "unsupported_schema_version");
        assert_eq!(
            err.to_string(),
            "entity store schema version 9 is newer than supported 1"
        );
    }
}
