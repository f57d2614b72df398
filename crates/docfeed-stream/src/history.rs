//! The history task: paginated backfill, then drain of the live backlog.

use std::sync::Arc;

use docfeed_db::RowQuery;
use docfeed_types::{Row, RowId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::cursor::{forward, CursorState, Shared};
use crate::feed::CursorTask;
use crate::store::{run_blocking, Store};

/// Replays matching rows in ID order, then forwards the backlog.
///
/// For a live-tail cursor the scan waits until the listener has subscribed,
/// so no insert can fall between the snapshot and the subscription. Rows in
/// the backlog with an ID at or below the last one emitted were already
/// covered by the scan and are skipped.
///
/// The output sender is dropped when this returns, which is what closes the
/// cursor for the consumer.
pub(crate) async fn run<S: Store>(
    task: Arc<CursorTask<S>>,
    out: mpsc::Sender<Row>,
    mut backlog: mpsc::Receiver<Row>,
    subscribed: oneshot::Receiver<()>,
) {
    let shared = &task.shared;
    let cancel = &shared.cancel;

    if task.filter.live_tail {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return finish(shared),
            ready = subscribed => {
                if ready.is_err() {
                    // The listener exited before subscribing and has
                    // recorded why.
                    return finish(shared);
                }
            }
        }
    }

    let Some(last_emitted) = backfill(&task, &out).await else {
        return finish(shared);
    };

    if !task.filter.live_tail {
        debug!(?last_emitted, "backfill complete");
        return finish(shared);
    }

    shared.set_state(CursorState::Draining);
    debug!(?last_emitted, "backfill complete; draining live rows");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = backlog.recv() => next,
        };
        let Some(row) = next else {
            break;
        };
        if last_emitted.is_some_and(|last| row.id <= last) {
            trace!(id = %row.id, "skipping live row already replayed");
            continue;
        }
        if !forward(&out, row, cancel).await {
            break;
        }
    }

    finish(shared);
}

/// Pages through the table. Returns the highest ID emitted, or `None` if the
/// scan stopped early on cancellation or error.
async fn backfill<S: Store>(task: &Arc<CursorTask<S>>, out: &mpsc::Sender<Row>) -> Option<Option<RowId>> {
    let shared = &task.shared;
    let page_size = task.settings.page_size;
    let mut last_emitted: Option<RowId> = None;
    let mut offset = task.filter.offset;

    loop {
        let query = RowQuery {
            predicate: task.filter.predicate.clone(),
            offset,
            after: last_emitted,
            limit: Some(page_size),
        };
        let table = task.table.clone();
        let page = match run_blocking(&task.store, &shared.cancel, move |store| store.query(&table, &query)).await {
            None => return None,
            Some(Err(e)) => {
                shared.fail(e);
                return None;
            }
            Some(Ok(page)) => page,
        };

        let fetched = page.len() as u64;
        trace!(fetched, ?last_emitted, "fetched history page");

        for row in page {
            let id = row.id;
            if !forward(out, row, &shared.cancel).await {
                return None;
            }
            last_emitted = Some(id);
        }

        if fetched < page_size {
            return Some(last_emitted);
        }
        // Later pages continue from the last key; the offset only applies
        // to the first.
        offset = 0;
    }
}

fn finish(shared: &Shared) {
    shared.set_state(CursorState::Closed);
}
