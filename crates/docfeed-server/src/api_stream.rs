//! SSE row stream handler.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use docfeed_stream::{Cursor, Filter, Row};
use futures_util::{stream, Stream};
use serde::Deserialize;

use crate::api::{ensure_table, parse_predicate, parse_table, ApiError};
use crate::AppState;

/// Query parameters for `GET /api/tables/{table}/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(rename = "where")]
    pub filter: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub live: bool,
}

/// Handler for `GET /api/tables/{table}/stream`.
///
/// Each row becomes one event whose `id` is the row ID. If the cursor ends
/// with an error, a final `error` event carries its message. The cursor is
/// closed when the client disconnects and the response stream is dropped.
pub async fn get_row_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let table = parse_table(&table)?;
    let predicate = parse_predicate(params.filter.as_deref())?;
    ensure_table(&state, &table).await?;

    let mut filter = Filter::new(predicate).with_offset(params.offset);
    if params.live {
        filter = filter.live();
    }
    let cursor = state.feed.get(&table, filter);
    tracing::info!(%table, cursor_id = %cursor.id(), live = params.live, "opened SSE row stream");

    Ok(Sse::new(row_events(cursor)).keep_alive(KeepAlive::default()))
}

fn row_events(cursor: Cursor) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(cursor), |state| async move {
        let mut cursor = state?;
        match cursor.recv().await {
            Some(row) => Some((Ok(row_event(&row)), Some(cursor))),
            None => {
                let err = cursor.err()?;
                Some((Ok(Event::default().event("error").data(err.to_string())), None))
            }
        }
    })
}

fn row_event(row: &Row) -> Event {
    let event = Event::default().id(row.id.to_string());
    match event.json_data(row) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(row_id = %row.id, error = %e, "failed to serialize row event");
            Event::default().event("error").data(e.to_string())
        }
    }
}
