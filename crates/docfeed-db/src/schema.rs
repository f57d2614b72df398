//! Document table provisioning.
//!
//! A provisioned table has an auto-incrementing integer key, a JSON `data`
//! column, one expression index per requested document path, and an insert
//! trigger that publishes the new row's ID on the table's channel through
//! [`crate::NOTIFY_FUNCTION`].

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::StoreError;
use crate::predicate::json_path;
use crate::pool::NOTIFY_FUNCTION;
use docfeed_types::{ChannelName, TableName};

/// A row of the `_docfeed_tables` registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    /// The document table.
    pub name: String,
    /// The channel its insert trigger publishes on.
    pub channel: String,
    /// Document paths with an expression index.
    pub indexed_paths: Vec<String>,
    /// When the table was first provisioned.
    pub created_at: String,
}

/// Creates `table`, its path indexes, and its notify trigger if they do not
/// exist, and records it in the registry.
///
/// Re-provisioning is idempotent; the trigger is recreated so a changed
/// channel prefix takes effect.
///
/// # Errors
///
/// Returns `StoreError::Predicate` for an invalid indexed path and
/// `StoreError::Database` on SQL failure. Nothing is created on error.
pub fn provision_table(
    conn: &Connection,
    table: &TableName,
    channel: &ChannelName,
    indexed_paths: &[String],
) -> Result<(), StoreError> {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data TEXT NOT NULL CHECK (json_valid(data))
        );
        DROP TRIGGER IF EXISTS \"{table}_notify\";
        CREATE TRIGGER \"{table}_notify\" AFTER INSERT ON \"{table}\"
        FOR EACH ROW BEGIN
            SELECT {NOTIFY_FUNCTION}('{channel}', CAST(NEW.id AS TEXT));
        END;"
    );

    for path in indexed_paths {
        let expr_path = json_path(path)?;
        let index = index_name(table, path);
        ddl.push_str(&format!(
            "\nCREATE INDEX IF NOT EXISTS \"{index}\" ON \"{table}\" (json_extract(data, '{expr_path}'));"
        ));
    }

    let paths_json = serde_json::to_string(indexed_paths)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&ddl)?;
    tx.execute(
        "INSERT INTO _docfeed_tables (name, channel, indexed_paths_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET channel = excluded.channel,
                                         indexed_paths_json = excluded.indexed_paths_json",
        params![table.as_str(), channel.as_str(), paths_json],
    )?;
    tx.commit()?;

    tracing::info!(%table, %channel, indexes = indexed_paths.len(), "provisioned document table");
    Ok(())
}

/// Lists the provisioned tables in name order.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn list_tables(conn: &Connection) -> Result<Vec<TableInfo>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name, channel, indexed_paths_json, created_at FROM _docfeed_tables ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut tables = Vec::new();
    for row in rows {
        let (name, channel, paths_json, created_at) = row?;
        tables.push(TableInfo {
            name,
            channel,
            indexed_paths: serde_json::from_str(&paths_json)?,
            created_at,
        });
    }
    Ok(tables)
}

/// Neither table names nor paths contain `:`, so distinct pairs never share
/// an index name, and no index name is a valid table name.
fn index_name(table: &TableName, path: &str) -> String {
    format!("{table}:{path}")
}
