use lifecycle_core::db::migrations::latest_version;
use lifecycle_core::db::{open_db, open_db_in_memory, restart_identities, DbError};
use lifecycle_core::{EntityManager, PersistError};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "parent");
    assert_table_exists(&conn, "child");
}

#[test]
fn opened_connection_enforces_foreign_keys() {
    let conn = open_db_in_memory().unwrap();

    let enabled: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(enabled, 1);

    let err = conn
        .execute(
            "INSERT INTO child (name, parent_id) VALUES ('stray', 42);",
            [],
        )
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY"));
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lifecycle.db");

    let conn_first = open_db(&path).unwrap();
    conn_first
        .execute("INSERT INTO parent (name) VALUES ('kept');", [])
        .unwrap();
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    let count: i64 = conn_second
        .query_row("SELECT COUNT(*) FROM parent;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn entity_manager_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();

    let err = EntityManager::try_new(&conn).err().unwrap();
    match err {
        PersistError::UninitializedConnection {
            expected_version,
            actual_version,
        } => {
            assert_eq!(expected_version, latest_version());
            assert_eq!(actual_version, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn entity_manager_rejects_missing_table() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&format!(
        "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         PRAGMA user_version = {};",
        latest_version()
    ))
    .unwrap();

    let err = EntityManager::try_new(&conn).err().unwrap();
    assert!(matches!(err, PersistError::MissingRequiredTable("child")));
}

#[test]
fn restart_identities_reseeds_from_current_maximum() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "INSERT INTO parent (id, name) VALUES (1, 'a');
         INSERT INTO parent (id, name) VALUES (7, 'b');
         DELETE FROM parent WHERE id = 7;",
    )
    .unwrap();

    restart_identities(&conn).unwrap();
    conn.execute("INSERT INTO parent (name) VALUES ('c');", [])
        .unwrap();
    assert_eq!(conn.last_insert_rowid(), 2);

    conn.execute("INSERT INTO child (name) VALUES ('first');", [])
        .unwrap();
    assert_eq!(conn.last_insert_rowid(), 1);
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
