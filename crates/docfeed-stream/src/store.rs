//! The datastore seam the cursor tasks drive.

use std::sync::Arc;

use docfeed_db::{Predicate, RowQuery, SqliteStore, StoreError, Subscription};
use docfeed_types::{Row, RowId, TableName};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

/// The operations a [`crate::Feed`] needs from a document store.
///
/// Every method is synchronous; the cursor tasks call them on the blocking
/// pool. Implementations must be shareable across tasks.
pub trait Store: Send + Sync + 'static {
    /// Inserts one document and returns its ID. The store must emit a
    /// notification carrying that ID once the insert commits.
    fn insert_document(&self, table: &TableName, doc: &Value) -> Result<RowId, StoreError>;

    /// Returns matching rows in ascending ID order.
    fn query(&self, table: &TableName, query: &RowQuery) -> Result<Vec<Row>, StoreError>;

    /// Returns row `id` if it is committed and satisfies `predicate`.
    fn fetch_committed(
        &self,
        table: &TableName,
        id: RowId,
        predicate: &Predicate,
    ) -> Result<Option<Row>, StoreError>;

    /// Subscribes to insert notifications for `table`.
    fn subscribe(&self, table: &TableName) -> Result<Subscription, StoreError>;

    /// Cheap liveness check.
    fn ping(&self) -> Result<(), StoreError>;
}

impl Store for SqliteStore {
    fn insert_document(&self, table: &TableName, doc: &Value) -> Result<RowId, StoreError> {
        self.insert(table, doc)
    }

    fn query(&self, table: &TableName, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        SqliteStore::query(self, table, query)
    }

    fn fetch_committed(
        &self,
        table: &TableName,
        id: RowId,
        predicate: &Predicate,
    ) -> Result<Option<Row>, StoreError> {
        SqliteStore::fetch_committed(self, table, id, predicate)
    }

    fn subscribe(&self, table: &TableName) -> Result<Subscription, StoreError> {
        SqliteStore::subscribe(self, table)
    }

    fn ping(&self) -> Result<(), StoreError> {
        SqliteStore::ping(self)
    }
}

/// Runs `op` against the store on the blocking pool.
///
/// Returns `None` if `cancel` fires first; the blocking call is left to
/// finish on its own and its result is dropped.
pub(crate) async fn run_blocking<S, T, F>(
    store: &Arc<S>,
    cancel: &CancellationToken,
    op: F,
) -> Option<Result<T, StreamError>>
where
    S: Store,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    let task = tokio::task::spawn_blocking(move || op(&store));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        joined = task => Some(match joined {
            Ok(result) => result.map_err(StreamError::from),
            Err(e) => Err(StreamError::from(e)),
        }),
    }
}
