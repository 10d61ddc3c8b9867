//! Row mapping between entities and the `parent`/`child` tables.
//!
//! # Responsibility
//! - Keep every SQL statement of the persistence engine in one place.
//! - Convert rows into entities and reject inconsistent persisted state.
//!
//! # Invariants
//! - A loaded parent carries its children ordered by `child.id ASC`.
//! - Every loaded child carries a back reference to its stored parent.

use crate::db::migrations::latest_version;
use crate::model::child::{Child, ChildId, ParentRef};
use crate::model::parent::{Parent, ParentId};
use crate::persistence::entity::EntityId;
use crate::persistence::error::{PersistError, PersistResult};
use rusqlite::{params, Connection, OptionalExtension, Row};

const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("parent", &["id", "name"]),
    ("child", &["id", "name", "parent_id"]),
];

/// Verifies the connection is migrated and exposes the expected schema.
pub fn ensure_connection_ready(conn: &Connection) -> PersistResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(PersistError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for &(table, columns) in REQUIRED_COLUMNS {
        if !table_exists(conn, table)? {
            return Err(PersistError::MissingRequiredTable(table));
        }
        for &column in columns {
            if !table_has_column(conn, table, column)? {
                return Err(PersistError::MissingRequiredColumn { table, column });
            }
        }
    }

    Ok(())
}

/// Inserts one parent row. `id = None` lets SQLite generate the identity.
pub fn insert_parent(conn: &Connection, id: Option<ParentId>, name: &str) -> PersistResult<ParentId> {
    conn.execute(
        "INSERT INTO parent (id, name) VALUES (?1, ?2);",
        params![id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_parent(conn: &Connection, id: ParentId, name: &str) -> PersistResult<usize> {
    let changed = conn.execute(
        "UPDATE parent SET name = ?2 WHERE id = ?1;",
        params![id, name],
    )?;
    Ok(changed)
}

pub fn insert_child(
    conn: &Connection,
    id: Option<ChildId>,
    name: &str,
    parent_id: Option<ParentId>,
) -> PersistResult<ChildId> {
    conn.execute(
        "INSERT INTO child (id, name, parent_id) VALUES (?1, ?2, ?3);",
        params![id, name, parent_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_child(
    conn: &Connection,
    id: ChildId,
    name: &str,
    parent_id: Option<ParentId>,
) -> PersistResult<usize> {
    let changed = conn.execute(
        "UPDATE child SET name = ?2, parent_id = ?3 WHERE id = ?1;",
        params![id, name, parent_id],
    )?;
    Ok(changed)
}

/// Clears the foreign key of `child_id` only while it still points at
/// `parent_id`, so a concurrent re-parent in the same flush is kept.
pub fn orphan_child(conn: &Connection, child_id: ChildId, parent_id: ParentId) -> PersistResult<usize> {
    let changed = conn.execute(
        "UPDATE child SET parent_id = NULL WHERE id = ?1 AND parent_id = ?2;",
        params![child_id, parent_id],
    )?;
    Ok(changed)
}

pub fn delete_row(conn: &Connection, table: &str, id: EntityId) -> PersistResult<usize> {
    let changed = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1;"), [id])?;
    Ok(changed)
}

pub fn delete_all_rows(conn: &Connection, table: &str) -> PersistResult<usize> {
    let changed = conn.execute(&format!("DELETE FROM {table};"), [])?;
    Ok(changed)
}

pub fn row_exists(conn: &Connection, table: &str, id: EntityId) -> PersistResult<bool> {
    let exists: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1);"),
        [id],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub fn count_rows(conn: &Connection, table: &str) -> PersistResult<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })?;
    u64::try_from(count)
        .map_err(|_| PersistError::InvalidData(format!("negative row count in {table}")))
}

pub fn list_ids(conn: &Connection, table: &str) -> PersistResult<Vec<EntityId>> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {table} ORDER BY id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

/// Loads one parent together with its stored children.
pub fn load_parent(conn: &Connection, id: ParentId) -> PersistResult<Option<Parent>> {
    let row = conn
        .query_row(
            "SELECT id, name FROM parent WHERE id = ?1;",
            [id],
            |row| Ok((row.get::<_, ParentId>("id")?, row.get::<_, String>("name")?)),
        )
        .optional()?;
    let Some((id, name)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, name
         FROM child
         WHERE parent_id = ?1
         ORDER BY id ASC;",
    )?;
    let mut rows = stmt.query([id])?;
    let mut children = Vec::new();
    while let Some(row) = rows.next()? {
        children.push(Child {
            id: Some(row.get("id")?),
            name: row.get("name")?,
            parent: Some(ParentRef::to_id(id, name.as_str())),
        });
    }

    Ok(Some(Parent {
        id: Some(id),
        name,
        children,
    }))
}

/// Loads one child with its back reference resolved.
pub fn load_child(conn: &Connection, id: ChildId) -> PersistResult<Option<Child>> {
    let mut stmt = conn.prepare(
        "SELECT
            c.id AS id,
            c.name AS name,
            c.parent_id AS parent_id,
            p.name AS parent_name
         FROM child c
         LEFT JOIN parent p ON p.id = c.parent_id
         WHERE c.id = ?1;",
    )?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_child_row(row)?));
    }
    Ok(None)
}

fn parse_child_row(row: &Row<'_>) -> PersistResult<Child> {
    let id: ChildId = row.get("id")?;
    let parent = match (
        row.get::<_, Option<ParentId>>("parent_id")?,
        row.get::<_, Option<String>>("parent_name")?,
    ) {
        (None, _) => None,
        (Some(parent_id), Some(parent_name)) => Some(ParentRef::to_id(parent_id, parent_name)),
        (Some(parent_id), None) => {
            return Err(PersistError::InvalidData(format!(
                "child#{id} references missing parent#{parent_id}"
            )));
        }
    };

    Ok(Child {
        id: Some(id),
        name: row.get("name")?,
        parent,
    })
}

fn table_exists(conn: &Connection, table: &str) -> PersistResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> PersistResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
