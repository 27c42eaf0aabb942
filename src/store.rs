//! Embedded per-scope SQLite plumbing.
//!
//! Every logical scope (identity, delegation, idempotency) owns exactly one
//! connection guarded by a [`parking_lot::Mutex`]. WAL journaling plus the
//! single-writer access pattern gives serializability without further lock
//! objects. Migrations are applied idempotently at open and recorded in
//! `_schema_migrations(scope, migration_name, applied_at)`.

use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

use crate::Result;

/// A named, idempotent schema migration.
pub type Migration = (&'static str, &'static str);

/// Open (or create) the SQLite database for `scope` and bring its schema up
/// to date.
///
/// # Errors
///
/// Returns an error when the parent directory cannot be created, the
/// database cannot be opened, or a migration statement fails.
pub fn open_scope(path: &Path, scope: &str, migrations: &[Migration]) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    apply_scope_migrations(&conn, scope, migrations)?;
    Ok(conn)
}

/// Open an in-memory database for `scope` (test isolation).
pub fn open_scope_in_memory(scope: &str, migrations: &[Migration]) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    apply_scope_migrations(&conn, scope, migrations)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // journal_mode returns the resulting mode as a row; in-memory databases
    // report "memory" instead of "wal", which is fine for tests.
    let _mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Apply all unapplied migrations for `scope` in order.
pub fn apply_scope_migrations(
    conn: &Connection,
    scope: &str,
    migrations: &[Migration],
) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _schema_migrations (
            scope TEXT NOT NULL,
            migration_name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (scope, migration_name)
        )",
    )?;

    for (name, sql) in migrations {
        let already_applied: bool = conn
            .query_row(
                "SELECT 1 FROM _schema_migrations WHERE scope = ?1 AND migration_name = ?2",
                (scope, name),
                |_| Ok(true),
            )
            .unwrap_or(false);
        if already_applied {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO _schema_migrations(scope, migration_name) VALUES (?1, ?2)",
            (scope, name),
        )?;
        debug!(scope, migration = name, "Applied schema migration");
    }
    Ok(())
}
