//! The consumer-facing cursor handle and the state its tasks share.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use docfeed_types::Row;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StreamError;

/// Lifecycle of a cursor, as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorState {
    /// Constructed; tasks not yet started.
    Created = 0,
    /// Backfilling historical rows.
    Running = 1,
    /// Backfill done; forwarding live rows.
    Draining = 2,
    /// Output closed.
    Closed = 3,
}

impl CursorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// State shared between a cursor, its closers, and its two tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancellationToken,
    closed: AtomicBool,
    state: AtomicU8,
    failure: OnceLock<StreamError>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(CursorState::Created as u8),
            failure: OnceLock::new(),
        }
    }

    /// Records `err` if it is the first error and cancels the sibling task.
    ///
    /// Errors observed after cancellation has begun are dropped, so a
    /// requested close never turns into an error.
    pub(crate) fn fail(&self, err: StreamError) {
        if self.cancel.is_cancelled() {
            tracing::debug!(cursor_id = %self.id, error = %err, "dropping error observed after cancellation");
            return;
        }
        match self.failure.set(err) {
            Ok(()) => {
                if let Some(err) = self.failure.get() {
                    tracing::warn!(cursor_id = %self.id, error = %err, "cursor failed");
                }
            }
            Err(later) => {
                tracing::debug!(cursor_id = %self.id, error = %later, "discarding secondary cursor error");
            }
        }
        self.cancel.cancel();
    }

    pub(crate) fn failure(&self) -> Option<&StreamError> {
        self.failure.get()
    }

    pub(crate) fn request_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(cursor_id = %self.id, "cursor close requested");
        self.cancel.cancel();
    }

    pub(crate) fn set_state(&self, state: CursorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn state(&self) -> CursorState {
        CursorState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Sends `row` unless the cursor is cancelled first.
///
/// Returns `false` when the row was not delivered and the caller should stop.
pub(crate) async fn forward(tx: &mpsc::Sender<Row>, row: Row, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(row) => sent.is_ok(),
    }
}

/// An ordered stream of rows: the historical backfill followed, for a
/// live-tail filter, by newly inserted matches.
///
/// Rows arrive in ascending ID order within the backfill and in commit
/// order afterwards, each at most once. The stream ends when the backfill
/// completes (one-shot), when [`Cursor::close`] is called, or when a task
/// fails; [`Cursor::err`] then tells the cases apart.
///
/// Dropping the cursor closes it.
#[derive(Debug)]
pub struct Cursor {
    rows: mpsc::Receiver<Row>,
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl Cursor {
    pub(crate) fn new(rows: mpsc::Receiver<Row>, shared: Arc<Shared>, supervisor: JoinHandle<()>) -> Self {
        Self {
            rows,
            shared,
            supervisor: Some(supervisor),
        }
    }

    /// Identifier used in this cursor's log records.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Receives the next row, or `None` once the output has closed.
    pub async fn recv(&mut self) -> Option<Row> {
        self.rows.recv().await
    }

    /// The terminal error, if any.
    ///
    /// Only meaningful after [`Cursor::recv`] has returned `None`, by which
    /// point any failure, including a task panic, has been recorded. `None`
    /// means the stream ended normally or was closed.
    pub fn err(&self) -> Option<&StreamError> {
        self.shared.failure()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CursorState {
        self.shared.state()
    }

    /// Requests shutdown. Idempotent and non-blocking; the output closes
    /// once both tasks have observed the cancellation.
    pub fn close(&self) {
        self.shared.request_close();
    }

    /// A cloneable handle that can close this cursor from another task.
    pub fn closer(&self) -> CursorCloser {
        CursorCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Closes the cursor, waits for both tasks to exit, and returns the
    /// terminal error if one was recorded before the close.
    pub async fn shutdown(mut self) -> Result<(), StreamError> {
        self.shared.request_close();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.await?;
        }
        match self.shared.failure() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Stream for Cursor {
    type Item = Row;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Row>> {
        self.rows.poll_recv(cx)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.shared.request_close();
    }
}

/// Closes a [`Cursor`] without owning it.
#[derive(Debug, Clone)]
pub struct CursorCloser {
    shared: Arc<Shared>,
}

impl CursorCloser {
    /// Same as [`Cursor::close`].
    pub fn close(&self) {
        self.shared.request_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_wins_and_cancels() {
        let shared = Shared::new();
        shared.fail(StreamError::TaskFailed("first".into()));
        assert!(shared.cancel.is_cancelled());

        shared.fail(StreamError::TaskFailed("second".into()));
        assert!(matches!(shared.failure(), Some(StreamError::TaskFailed(m)) if m == "first"));
    }

    #[test]
    fn failure_after_close_is_dropped() {
        let shared = Shared::new();
        shared.request_close();
        shared.fail(StreamError::TaskFailed("late".into()));
        assert!(shared.failure().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let shared = Shared::new();
        shared.request_close();
        shared.request_close();
        assert!(shared.cancel.is_cancelled());
    }

    #[test]
    fn state_round_trips_through_atomic() {
        let shared = Shared::new();
        assert_eq!(shared.state(), CursorState::Created);
        shared.set_state(CursorState::Draining);
        assert_eq!(shared.state(), CursorState::Draining);
    }

    #[tokio::test]
    async fn forward_stops_on_cancel_when_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let row = |id| Row {
            id: docfeed_types::RowId(id),
            data: serde_json::Value::Null,
        };

        assert!(forward(&tx, row(1), &cancel).await);
        cancel.cancel();
        assert!(!forward(&tx, row(2), &cancel).await);
    }
}
