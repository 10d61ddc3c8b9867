//! Error type shared by the entity manager and repositories.

use crate::db::DbError;
use crate::persistence::entity::EntityId;
use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PersistResult<T> = Result<T, PersistError>;

/// Errors raised by persistence context operations.
#[derive(Debug)]
pub enum PersistError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Persist was handed an entity whose identity is already managed or
    /// already present in storage.
    EntityExists { table: &'static str, id: EntityId },
    /// Row expected by the operation does not exist.
    EntityNotFound { table: &'static str, id: EntityId },
    /// A reference points at an entity that was never written.
    TransientReference { table: &'static str },
    /// Operation requires a handle managed by this entity manager.
    NotManaged { table: &'static str },
    /// A managed instance is still borrowed through `EntityRef::read`/`write`
    /// while the manager needs to sync it.
    EntityBorrowed { table: &'static str, id: EntityId },
    /// Storage rejected a write (foreign key, uniqueness, not-null).
    ConstraintViolation(String),
    TransactionAlreadyActive,
    NoActiveTransaction,
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted or managed state cannot be mapped consistently.
    InvalidData(String),
}

impl PersistError {
    /// Stable machine-readable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Db(err) => err.code(),
            Self::EntityExists { .. } => "entity_exists",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::TransientReference { .. } => "transient_reference",
            Self::NotManaged { .. } => "not_managed",
            Self::EntityBorrowed { .. } => "entity_borrowed",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::TransactionAlreadyActive => "transaction_already_active",
            Self::NoActiveTransaction => "no_active_transaction",
            Self::UninitializedConnection { .. } => "uninitialized_connection",
            Self::MissingRequiredTable(_) => "missing_required_table",
            Self::MissingRequiredColumn { .. } => "missing_required_column",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::EntityExists { table, id } => {
                write!(f, "entity already persisted: {table}#{id}")
            }
            Self::EntityNotFound { table, id } => write!(f, "entity not found: {table}#{id}"),
            Self::TransientReference { table } => write!(
                f,
                "reference to an unsaved transient {table} entity; write it first"
            ),
            Self::NotManaged { table } => {
                write!(f, "{table} entity is not managed by this entity manager")
            }
            Self::EntityBorrowed { table, id } => write!(
                f,
                "{table}#{id} is borrowed through its handle; drop the guard before flushing"
            ),
            Self::ConstraintViolation(message) => write!(f, "constraint violation: {message}"),
            Self::TransactionAlreadyActive => write!(f, "a transaction scope is already active"),
            Self::NoActiveTransaction => write!(f, "no transaction scope is active"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "entity manager requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "entity manager requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "entity manager requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for PersistError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for PersistError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::SqliteFailure(err, message)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(
                    message.clone().unwrap_or_else(|| err.to_string()),
                )
            }
            _ => Self::Db(DbError::Sqlite(value)),
        }
    }
}
