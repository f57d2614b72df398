//! The SQLite-backed document store.
//!
//! [`SqliteStore`] bundles the connection pool, the notification hub, and
//! the deployment's channel prefix. All methods are blocking; async callers
//! run them on `tokio::task::spawn_blocking`.

use std::sync::Arc;

use rusqlite::{params, params_from_iter};
use rusqlite::types::Value as SqlValue;

use crate::error::StoreError;
use crate::migrations::run_migrations;
use crate::notify::{NotifyHub, NotifySettings, Subscription};
use crate::pool::{create_pool, flush_notifications, DbPool, DbRuntimeSettings};
use crate::predicate::Predicate;
use crate::schema::{self, TableInfo};
use docfeed_types::{validate_prefix, ChannelName, Row, RowId, TableName};

/// Default notification channel prefix.
pub const DEFAULT_NOTIFY_PREFIX: &str = "docfeed_notify";

/// Everything needed to open a [`SqliteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Connection pool tunables.
    pub db: DbRuntimeSettings,
    /// Notification hub tunables.
    pub notify: NotifySettings,
    /// Channel prefix; channels are named `{prefix}_{table}`.
    ///
    /// Independent deployments sharing infrastructure should use distinct
    /// prefixes.
    pub notify_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db: DbRuntimeSettings::default(),
            notify: NotifySettings::default(),
            notify_prefix: DEFAULT_NOTIFY_PREFIX.to_string(),
        }
    }
}

/// One page of an ascending, predicate-filtered scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
    /// Rows must satisfy this predicate.
    pub predicate: Predicate,
    /// Number of leading matches to skip.
    pub offset: u64,
    /// Only rows with an ID strictly greater than this.
    pub after: Option<RowId>,
    /// Maximum rows to return; `None` means unbounded.
    pub limit: Option<u64>,
}

/// A document store on a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
    hub: Arc<NotifyHub>,
    prefix: String,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `db_path` and applies
    /// pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Identifier` for an invalid prefix, and pool,
    /// migration, or database errors otherwise.
    pub fn open(db_path: &str, settings: StoreSettings) -> Result<Self, StoreError> {
        validate_prefix(&settings.notify_prefix)?;

        let hub = Arc::new(NotifyHub::new(settings.notify));
        let pool = create_pool(db_path, settings.db, Arc::clone(&hub))?;

        let applied = {
            let conn = pool.get()?;
            run_migrations(&conn)?
        };
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }

        Ok(Self {
            pool,
            hub,
            prefix: settings.notify_prefix,
        })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The notification hub fed by this store's commit hooks.
    pub fn hub(&self) -> &Arc<NotifyHub> {
        &self.hub
    }

    /// The channel prefix this store was opened with.
    pub fn notify_prefix(&self) -> &str {
        &self.prefix
    }

    /// The notification channel for `table`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Identifier` if the derived name is invalid.
    pub fn channel(&self, table: &TableName) -> Result<ChannelName, StoreError> {
        Ok(ChannelName::for_table(&self.prefix, table)?)
    }

    /// Provisions `table` with expression indexes on `indexed_paths`.
    ///
    /// # Errors
    ///
    /// See [`schema::provision_table`].
    pub fn provision_table(
        &self,
        table: &TableName,
        indexed_paths: &[String],
    ) -> Result<(), StoreError> {
        let channel = self.channel(table)?;
        let conn = self.pool.get()?;
        schema::provision_table(&conn, table, &channel, indexed_paths)
    }

    /// Lists provisioned tables.
    ///
    /// # Errors
    ///
    /// Returns pool or database errors.
    pub fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let conn = self.pool.get()?;
        schema::list_tables(&conn)
    }

    /// Inserts `doc` and returns its newly assigned ID.
    ///
    /// The table's trigger stages the ID; it is published once the insert
    /// has committed and is visible to every other connection.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the table does not exist or the
    /// insert fails.
    pub fn insert(&self, table: &TableName, doc: &serde_json::Value) -> Result<RowId, StoreError> {
        let data = serde_json::to_string(doc)?;
        let conn = self.pool.get()?;
        let id: i64 = conn.query_row(
            &format!("INSERT INTO \"{table}\" (data) VALUES (?1) RETURNING id"),
            params![data],
            |row| row.get(0),
        )?;
        // The autocommit transaction has finished once query_row returns.
        let published = flush_notifications(&conn)?;
        tracing::trace!(%table, row_id = id, published, "inserted document");
        Ok(RowId(id))
    }

    /// Returns one page of rows matching `query`, ascending by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Predicate` if the predicate cannot be rendered,
    /// and pool, database, or serialization errors otherwise.
    pub fn query(&self, table: &TableName, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        let fragment = query.predicate.to_sql()?;
        let mut sql = format!("SELECT id, data FROM \"{table}\" WHERE ({})", fragment.sql);
        let mut bound = fragment.params;

        if let Some(after) = query.after {
            sql.push_str(" AND id > ?");
            bound.push(SqlValue::Integer(after.get()));
        }

        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
        bound.push(SqlValue::Integer(
            query.limit.map(clamp_to_i64).unwrap_or(-1),
        ));
        bound.push(SqlValue::Integer(clamp_to_i64(query.offset)));

        let conn = self.pool.get()?;
        select_rows(&conn, &sql, &bound)
    }

    /// Fetches row `id` if it satisfies `predicate`.
    ///
    /// A plain read: notifications are only published after the writing
    /// commit is visible, so the notified row is already readable and the
    /// read never waits on an unrelated writer.
    ///
    /// # Errors
    ///
    /// Returns pool, predicate, database, or serialization errors.
    pub fn fetch_committed(
        &self,
        table: &TableName,
        id: RowId,
        predicate: &Predicate,
    ) -> Result<Option<Row>, StoreError> {
        let fragment = Predicate::IdEq(id.get()).and(predicate.clone()).to_sql()?;
        let sql = format!(
            "SELECT id, data FROM \"{table}\" WHERE ({}) ORDER BY id ASC",
            fragment.sql
        );

        let conn = self.pool.get()?;
        let mut rows = select_rows(&conn, &sql, &fragment.params)?;
        Ok(rows.pop())
    }

    /// Subscribes to the notification channel of `table`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Identifier` if the channel name is invalid.
    pub fn subscribe(&self, table: &TableName) -> Result<Subscription, StoreError> {
        let channel = self.channel(table)?;
        Ok(self.hub.listen(channel.as_str()))
    }

    /// Checks that a pooled connection can execute a statement.
    ///
    /// # Errors
    ///
    /// Returns pool or database errors.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn select_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    bound: &[SqlValue],
) -> Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt.query_map(params_from_iter(bound.iter()), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut rows = Vec::new();
    for item in raw {
        let (id, data) = item?;
        rows.push(Row {
            id: RowId(id),
            data: serde_json::from_str(&data)?,
        });
    }
    Ok(rows)
}
