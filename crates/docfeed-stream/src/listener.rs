//! The listener task: turns insert notifications into backlog rows.

use std::sync::Arc;

use docfeed_db::{RowQuery, SubscriptionError};
use docfeed_types::{Notification, Row, RowId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn, Instrument};

use crate::cursor::forward;
use crate::error::StreamError;
use crate::feed::CursorTask;
use crate::store::{run_blocking, Store};

/// Subscribes, signals `subscribed`, then re-checks each notified row
/// against the filter and pushes matches to `backlog`.
///
/// If the subscription lags and notifications are dropped, the missed rows
/// are recovered by querying the table past the highest ID already forwarded.
/// A one-shot cursor has nothing to listen for and returns at once. The
/// subscription and the backlog sender are both released on return.
pub(crate) async fn run<S: Store>(
    task: Arc<CursorTask<S>>,
    backlog: mpsc::Sender<Row>,
    subscribed: oneshot::Sender<()>,
) {
    if !task.filter.live_tail {
        return;
    }

    let shared = &task.shared;
    let cancel = &shared.cancel;

    let table = task.table.clone();
    let mut subscription = match run_blocking(&task.store, cancel, move |store| store.subscribe(&table)).await {
        None => return,
        Some(Err(e)) => {
            shared.fail(e);
            return;
        }
        Some(Ok(subscription)) => subscription,
    };
    debug!(channel = subscription.channel(), "subscribed");
    let _ = subscribed.send(());

    let period = task.settings.keepalive;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Highest ID forwarded. Notifications arrive in commit order, which is
    // ID order, so anything at or below it is a repeat.
    let mut forwarded: Option<RowId> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = subscription.recv() => {
                keepalive.reset();
                let keep_going = match received {
                    Ok(notification) => handle(&task, &backlog, notification, &mut forwarded).await,
                    Err(SubscriptionError::Lagged(missed)) => {
                        warn!(missed, ?forwarded, "notifications dropped, catching up from the table");
                        catch_up(&task, &backlog, &mut forwarded).await
                    }
                    Err(e) => {
                        shared.fail(StreamError::from(e));
                        false
                    }
                };
                if !keep_going {
                    break;
                }
            }
            _ = keepalive.tick() => keepalive_ping(Arc::clone(&task.store)),
        }
    }
}

/// Re-checks one notified row. Returns `false` when the listener should stop.
async fn handle<S: Store>(
    task: &Arc<CursorTask<S>>,
    backlog: &mpsc::Sender<Row>,
    notification: Notification,
    forwarded: &mut Option<RowId>,
) -> bool {
    let shared = &task.shared;

    let id = match notification.payload.parse::<i64>() {
        Ok(id) => RowId(id),
        Err(_) => {
            shared.fail(StreamError::MalformedNotification {
                channel: notification.channel,
                payload: notification.payload,
            });
            return false;
        }
    };
    if forwarded.is_some_and(|through| id <= through) {
        trace!(%id, "notified row already forwarded");
        return true;
    }

    let table = task.table.clone();
    let predicate = task.filter.predicate.clone();
    let fetched = run_blocking(&task.store, &shared.cancel, move |store| {
        store.fetch_committed(&table, id, &predicate)
    })
    .await;

    match fetched {
        None => false,
        Some(Err(e)) => {
            shared.fail(e);
            false
        }
        Some(Ok(None)) => {
            trace!(%id, "notified row does not match filter");
            true
        }
        Some(Ok(Some(row))) => {
            if !forward(backlog, row, &shared.cancel).await {
                return false;
            }
            advance(forwarded, id);
            true
        }
    }
}

/// Pages every match with an ID above `forwarded` into the backlog, until a
/// short page shows the listener has reached the end of the table.
async fn catch_up<S: Store>(
    task: &Arc<CursorTask<S>>,
    backlog: &mpsc::Sender<Row>,
    forwarded: &mut Option<RowId>,
) -> bool {
    let shared = &task.shared;
    let page_size = task.settings.page_size;
    let mut recovered = 0u64;

    loop {
        let query = RowQuery {
            predicate: task.filter.predicate.clone(),
            offset: 0,
            after: *forwarded,
            limit: Some(page_size),
        };
        let table = task.table.clone();
        let page = match run_blocking(&task.store, &shared.cancel, move |store| store.query(&table, &query)).await {
            None => return false,
            Some(Err(e)) => {
                shared.fail(e);
                return false;
            }
            Some(Ok(page)) => page,
        };

        let fetched = page.len() as u64;
        for row in page {
            let id = row.id;
            if !forward(backlog, row, &shared.cancel).await {
                return false;
            }
            advance(forwarded, id);
        }
        recovered += fetched;

        if fetched < page_size {
            debug!(recovered, ?forwarded, "caught up after lag");
            return true;
        }
    }
}

fn advance(forwarded: &mut Option<RowId>, id: RowId) {
    *forwarded = Some(forwarded.map_or(id, |through| through.max(id)));
}

/// Fires a detached liveness ping. A failed ping is logged and otherwise
/// ignored; the subscription itself reports real connection loss.
fn keepalive_ping<S: Store>(store: Arc<S>) {
    let check = async move {
        match tokio::task::spawn_blocking(move || store.ping()).await {
            Ok(Ok(())) => trace!("keepalive ping ok"),
            Ok(Err(e)) => warn!(error = %e, "keepalive ping failed"),
            Err(e) => warn!(error = %e, "keepalive ping task failed"),
        }
    };
    tokio::spawn(check.in_current_span());
}
