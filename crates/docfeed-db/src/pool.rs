//! Connection pool creation and configuration.

use std::sync::{Arc, Mutex};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Null;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::notify::NotifyHub;
use docfeed_types::Notification;

/// Name of the SQL function insert triggers call to publish a notification.
pub const NOTIFY_FUNCTION: &str = "docfeed_notify";

/// Name of the SQL function that publishes committed notifications.
pub const FLUSH_FUNCTION: &str = "docfeed_flush_notifications";

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Creates a new SQLite connection pool with WAL mode, foreign keys, and
/// the notification function installed on every connection.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. `:memory:` gives every
///   pooled connection its own private database, so live tailing needs a
///   file path.
/// * `hub` - The hub that receives notifications once the writing
///   transaction has committed and been flushed.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the connection pool cannot be created.
pub fn create_pool(
    db_path: &str,
    settings: DbRuntimeSettings,
    hub: Arc<NotifyHub>,
) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))?;
            install_notify_hooks(conn, hub.clone())
        });

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    Ok(pool)
}

/// Per-connection notification state.
#[derive(Default)]
struct Outbox {
    /// Calls made inside the open transaction.
    staged: Vec<Notification>,
    /// Hub sequence mark covering this connection's last committed batch.
    mark: u64,
}

/// Registers [`NOTIFY_FUNCTION`], [`FLUSH_FUNCTION`], and the commit and
/// rollback hooks on `conn`.
///
/// The commit hook runs before the commit is visible to other connections,
/// so it only queues staged notifications on `hub` in commit order. They
/// are published when [`flush_notifications`] runs on the same connection
/// after the committing statement has returned. Rolled-back notifications
/// are discarded.
pub fn install_notify_hooks(conn: &Connection, hub: Arc<NotifyHub>) -> rusqlite::Result<()> {
    let outbox: Arc<Mutex<Outbox>> = Arc::default();

    let stage = Arc::clone(&outbox);
    conn.create_scalar_function(NOTIFY_FUNCTION, 2, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let channel: String = ctx.get(0)?;
        let payload: String = ctx.get(1)?;
        let mut outbox = stage.lock().map_err(|_| poisoned())?;
        outbox.staged.push(Notification { channel, payload });
        Ok(Null)
    })?;

    let flush = Arc::clone(&outbox);
    let flush_hub = Arc::clone(&hub);
    conn.create_scalar_function(FLUSH_FUNCTION, 0, FunctionFlags::SQLITE_UTF8, move |_| {
        let mark = flush.lock().map_err(|_| poisoned())?.mark;
        Ok(flush_hub.release_through(mark) as i64)
    })?;

    let on_commit = Arc::clone(&outbox);
    conn.commit_hook(Some(move || {
        if let Ok(mut outbox) = on_commit.lock() {
            if !outbox.staged.is_empty() {
                let batch = std::mem::take(&mut outbox.staged);
                outbox.mark = hub.enqueue_committed(batch);
            }
        }
        // false lets the commit proceed.
        false
    }));

    let on_rollback = outbox;
    conn.rollback_hook(Some(move || {
        if let Ok(mut outbox) = on_rollback.lock() {
            outbox.staged.clear();
        }
    }));

    Ok(())
}

/// Publishes the notifications of transactions that `conn` has committed,
/// along with any committed earlier by other connections on the same hub.
///
/// Must run outside any open transaction on `conn`, after the committing
/// statement has returned. Writers that bypass `SqliteStore::insert` call
/// this after their own commits. Returns how many notifications were
/// published.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the hooks are not installed on `conn`.
pub fn flush_notifications(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(&format!("SELECT {FLUSH_FUNCTION}()"), [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn poisoned() -> rusqlite::Error {
    rusqlite::Error::UserFunctionError("notification outbox lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifySettings;

    fn hub() -> Arc<NotifyHub> {
        Arc::new(NotifyHub::new(NotifySettings::default()))
    }

    #[test]
    fn create_in_memory_pool() {
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
        };

        let pool = create_pool(":memory:", settings, hub()).expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert!(
            mode == "wal" || mode == "memory",
            "unexpected journal_mode: {mode}"
        );

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");

        assert_eq!(pool.max_size(), 3, "pool max size should match settings");
    }

    #[tokio::test]
    async fn notifications_publish_on_flush_after_commit() {
        let hub = hub();
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        install_notify_hooks(&conn, hub.clone()).expect("hooks should install");

        let mut sub = hub.listen("chan");

        conn.execute_batch(
            "BEGIN;
             SELECT docfeed_notify('chan', 'rolled-back');
             ROLLBACK;",
        )
        .expect("rolled back batch should run");

        conn.execute_batch(
            "BEGIN;
             CREATE TABLE t (id INTEGER PRIMARY KEY);
             SELECT docfeed_notify('chan', '1');
             COMMIT;",
        )
        .expect("committed batch should run");
        assert!(sub.try_recv().is_none(), "commit alone must not publish");

        assert_eq!(flush_notifications(&conn).expect("flush should run"), 1);
        let received = sub.recv().await.expect("should receive committed notification");
        assert_eq!(received.payload, "1");
        assert!(
            sub.try_recv().is_none(),
            "rolled-back notification must never be published"
        );
        assert_eq!(flush_notifications(&conn).expect("second flush should run"), 0);
    }

    #[test]
    fn flush_by_a_later_writer_releases_earlier_commits_in_order() {
        let hub = hub();
        let first = Connection::open_in_memory().expect("should open in-memory db");
        let second = Connection::open_in_memory().expect("should open in-memory db");
        install_notify_hooks(&first, hub.clone()).expect("hooks should install");
        install_notify_hooks(&second, hub.clone()).expect("hooks should install");
        let mut sub = hub.listen("chan");

        first
            .execute_batch(
                "BEGIN;
                 CREATE TABLE t (id INTEGER PRIMARY KEY);
                 SELECT docfeed_notify('chan', '5');
                 COMMIT;",
            )
            .expect("first commit should run");
        second
            .execute_batch(
                "BEGIN;
                 CREATE TABLE t (id INTEGER PRIMARY KEY);
                 SELECT docfeed_notify('chan', '6');
                 COMMIT;",
            )
            .expect("second commit should run");

        assert_eq!(flush_notifications(&second).expect("flush should run"), 2);
        assert_eq!(flush_notifications(&first).expect("flush should run"), 0);
        assert_eq!(sub.try_recv().map(|n| n.payload).as_deref(), Some("5"));
        assert_eq!(sub.try_recv().map(|n| n.payload).as_deref(), Some("6"));
    }

    #[test]
    fn flush_inside_open_transaction_holds_back_staged_calls() {
        let hub = hub();
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        install_notify_hooks(&conn, hub.clone()).expect("hooks should install");
        let mut sub = hub.listen("chan");

        conn.execute_batch(
            "BEGIN;
             CREATE TABLE t (id INTEGER PRIMARY KEY);
             SELECT docfeed_notify('chan', '7');",
        )
        .expect("staging should run");
        assert_eq!(flush_notifications(&conn).expect("flush should run"), 0);
        conn.execute_batch("COMMIT;").expect("commit should run");
        assert_eq!(flush_notifications(&conn).expect("flush should run"), 1);
        assert_eq!(sub.try_recv().map(|n| n.payload).as_deref(), Some("7"));
    }
}
