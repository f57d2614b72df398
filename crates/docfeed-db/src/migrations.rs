//! Bookkeeping schema, applied when a store opens.
//!
//! Document tables are not migrations; [`crate::provision_table`] creates
//! them on demand. Migrations only cover docfeed's own tables and are
//! recorded by name in `_docfeed_migrations`.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

/// Ordered `(name, sql)` pairs. Append only.
const MIGRATIONS: &[(&str, &str)] = &[("000_init", include_str!("migrations/000_init.sql"))];

const LEDGER: &str = "CREATE TABLE IF NOT EXISTS _docfeed_migrations (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration, or the ledger that records it, failed to apply.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The ledger could not be read.
    #[error("failed to read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every migration not yet in the ledger and returns how many ran.
///
/// Each migration and its ledger row commit together.
///
/// # Errors
///
/// Returns `MigrationError` if the ledger cannot be read or a migration
/// fails; that migration leaves no trace.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[(&str, &str)]) -> Result<usize, MigrationError> {
    conn.execute_batch(LEDGER)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_docfeed_migrations".to_string(),
            source,
        })?;

    let done = applied(conn).map_err(MigrationError::StateQuery)?;
    let pending: Vec<_> = migrations
        .iter()
        .filter(|(name, _)| !done.contains(*name))
        .collect();

    for (name, sql) in &pending {
        tracing::info!(migration = *name, "applying migration");
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.execute("INSERT INTO _docfeed_migrations (name) VALUES (?1)", [*name])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;
    }

    Ok(pending.len())
}

fn applied(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _docfeed_migrations")?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM pragma_table_info('{table}')"))
            .unwrap();
        let names = stmt.query_map([], |row| row.get(0)).unwrap();
        names.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn init_creates_the_table_registry() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(
            columns(&conn, "_docfeed_tables"),
            vec!["name", "channel", "indexed_paths_json", "created_at"]
        );
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn only_new_migrations_run_on_reopen() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let next = [
            MIGRATIONS[0],
            ("001_extra", "CREATE TABLE _docfeed_extra (id INTEGER PRIMARY KEY);"),
        ];
        assert_eq!(apply(&conn, &next).unwrap(), 1);
        assert_eq!(columns(&conn, "_docfeed_extra"), vec!["id"]);
    }

    #[test]
    fn failed_migration_is_not_recorded() {
        let conn = Connection::open_in_memory().unwrap();
        let broken = [(
            "001_broken",
            "CREATE TABLE _docfeed_half (id INTEGER); SELECT * FROM no_such_table;",
        )];

        let err = apply(&conn, &broken).expect_err("broken migration should fail");
        assert!(matches!(err, MigrationError::ExecutionFailed { ref name, .. } if name == "001_broken"));
        assert!(columns(&conn, "_docfeed_half").is_empty());
        assert!(applied(&conn).unwrap().is_empty());
    }
}
