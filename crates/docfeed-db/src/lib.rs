//! Database layer for docfeed.
//!
//! Provides SQLite connection pooling (via `r2d2`), embedded migrations,
//! document table provisioning, the predicate renderer, and the
//! commit-driven notification hub that stands in for a native
//! LISTEN/NOTIFY facility.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: no external database process. WAL allows
//!   concurrent readers alongside the single writer, which is what a
//!   backfill scan racing live inserts needs.
//! - **Notify after commit**: insert triggers call `docfeed_notify`, which
//!   only stages the notification on its connection. The commit hook marks
//!   staged notifications committed and the rollback hook drops them.
//!   [`flush_notifications`] publishes committed ones once the writing
//!   statement has returned, so a subscriber only hears about rows every
//!   other connection can already read.
//! - **Opaque documents**: rows hold arbitrary JSON. Only
//!   [`Predicate::to_sql`] looks inside them.

mod error;
mod migrations;
mod notify;
mod pool;
mod predicate;
mod schema;
mod store;

pub use error::StoreError;
pub use migrations::{run_migrations, MigrationError};
pub use notify::{NotifyHub, NotifySettings, Subscription, SubscriptionError};
pub use pool::{
    create_pool, flush_notifications, install_notify_hooks, DbPool, DbRuntimeSettings, PoolError,
    FLUSH_FUNCTION, NOTIFY_FUNCTION,
};
pub use predicate::{Predicate, PredicateError, SqlFragment};
pub use schema::{list_tables, provision_table, TableInfo};
pub use store::{RowQuery, SqliteStore, StoreSettings, DEFAULT_NOTIFY_PREFIX};
