//! Identity sequence maintenance.
//!
//! SQLite keeps `AUTOINCREMENT` high-water marks in `sqlite_sequence`.
//! Restarting a sequence re-seeds it from the current maximum id, so the next
//! generated id is `max(id) + 1`, or `1` for an empty table.

use super::DbResult;
use log::info;
use rusqlite::Connection;

const IDENTITY_TABLES: [&str; 2] = ["parent", "child"];

/// Restarts identity generation for every entity table.
///
/// # Side effects
/// - Rewrites `sqlite_sequence` rows for `parent` and `child`.
/// - Emits a `restart_identities` logging event.
pub fn restart_identities(conn: &Connection) -> DbResult<()> {
    for table in IDENTITY_TABLES {
        conn.execute("DELETE FROM sqlite_sequence WHERE name = ?1;", [table])?;
        conn.execute(
            &format!(
                "INSERT INTO sqlite_sequence (name, seq)
                 SELECT ?1, max_id
                 FROM (SELECT MAX(id) AS max_id FROM {table})
                 WHERE max_id IS NOT NULL;"
            ),
            [table],
        )?;
    }

    info!(
        "event=restart_identities module=db status=ok tables={}",
        IDENTITY_TABLES.join(",")
    );
    Ok(())
}
