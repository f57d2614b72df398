//! The entry point: opens cursors and inserts documents.

use std::sync::Arc;

use docfeed_db::SqliteStore;
use docfeed_types::{Row, RowId, TableName};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::cursor::{Cursor, CursorState, Shared};
use crate::error::StreamError;
use crate::filter::Filter;
use crate::settings::StreamSettings;
use crate::store::Store;
use crate::{history, listener};

/// Everything one cursor's tasks need, shared between them.
pub(crate) struct CursorTask<S> {
    pub(crate) store: Arc<S>,
    pub(crate) table: TableName,
    pub(crate) filter: Filter,
    pub(crate) settings: StreamSettings,
    pub(crate) shared: Arc<Shared>,
}

/// Opens cursors over a [`Store`].
///
/// Cloning is cheap; clones share the store.
#[derive(Debug)]
pub struct Feed<S = SqliteStore> {
    store: Arc<S>,
    settings: StreamSettings,
}

impl<S> Clone for Feed<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

impl<S: Store> Feed<S> {
    /// Creates a feed with default [`StreamSettings`].
    pub fn new(store: S) -> Self {
        Self::with_settings(store, StreamSettings::default())
    }

    pub fn with_settings(store: S, settings: StreamSettings) -> Self {
        Self {
            store: Arc::new(store),
            settings: settings.normalized(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Opens a cursor over `table` and starts its tasks.
    ///
    /// Never fails synchronously: a missing table or a failed subscription
    /// shows up as an early end of the stream with [`Cursor::err`] set.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get(&self, table: &TableName, filter: Filter) -> Cursor {
        let shared = Arc::new(Shared::new());
        let (out_tx, out_rx) = mpsc::channel(self.settings.output_capacity);
        let (backlog_tx, backlog_rx) = mpsc::channel(self.settings.backlog_capacity);
        let (subscribed_tx, subscribed_rx) = oneshot::channel();

        let span = tracing::info_span!("cursor", cursor_id = %shared.id, %table);
        span.in_scope(|| {
            tracing::info!(live_tail = filter.live_tail, offset = filter.offset, "opening cursor");
        });

        let task = Arc::new(CursorTask {
            store: Arc::clone(&self.store),
            table: table.clone(),
            filter,
            settings: self.settings,
            shared: Arc::clone(&shared),
        });

        shared.set_state(CursorState::Running);
        let out_guard = out_tx.clone();
        let history = tokio::spawn(
            history::run(Arc::clone(&task), out_tx, backlog_rx, subscribed_rx).instrument(span.clone()),
        );
        let listener = tokio::spawn(listener::run(task, backlog_tx, subscribed_tx).instrument(span.clone()));

        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), history, listener, out_guard).instrument(span));

        Cursor::new(out_rx, shared, supervisor)
    }

    /// Serializes `doc` and inserts it into `table`, returning the new ID.
    ///
    /// Open live-tail cursors on `table` see the row once the insert has
    /// committed.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Serialization` if `doc` cannot be represented
    /// as JSON and `StreamError::Store` if the insert fails.
    pub async fn add<T: Serialize + ?Sized>(&self, table: &TableName, doc: &T) -> Result<RowId, StreamError> {
        let value = serde_json::to_value(doc)?;
        let store = Arc::clone(&self.store);
        let table = table.clone();
        let id = tokio::task::spawn_blocking(move || store.insert_document(&table, &value)).await??;
        Ok(id)
    }
}

/// Waits for both cursor tasks and records a panic in either as
/// [`StreamError::TaskFailed`].
///
/// `out_guard` keeps the output open until both outcomes are recorded, so a
/// consumer that sees the end of the stream also sees the failure.
async fn supervise(
    shared: Arc<Shared>,
    history: JoinHandle<()>,
    listener: JoinHandle<()>,
    out_guard: mpsc::Sender<Row>,
) {
    let record = |name: &'static str, joined: Result<(), tokio::task::JoinError>| {
        if let Err(e) = joined {
            // Cancels the sibling so it stops too.
            shared.fail(StreamError::TaskFailed(format!("{name} task: {e}")));
        }
    };
    tokio::join!(
        async { record("history", history.await) },
        async { record("listener", listener.await) },
    );
    drop(out_guard);

    shared.set_state(CursorState::Closed);
    tracing::info!(failed = shared.failure().is_some(), "cursor closed");
}
