//! JSON API handlers for tables, documents, and row queries.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use docfeed_db::{Predicate, StoreError, TableInfo};
use docfeed_stream::{Filter, Row, StreamError};
use docfeed_types::TableName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::AppState;

/// Rows returned by `GET /rows` when no `limit` is given.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Upper bound on `limit` for `GET /rows`.
pub const MAX_ROW_LIMIT: usize = 10_000;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Predicate(_) | StoreError::Identifier(_) => ApiError::BadRequest(err.to_string()),
            other => {
                tracing::error!(error = %other, "store operation failed");
                ApiError::InternalServerError(other.to_string())
            }
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Store(store) => match store.as_ref() {
                StoreError::Predicate(_) | StoreError::Identifier(_) => ApiError::BadRequest(store.to_string()),
                _ => {
                    tracing::error!(error = %store, "cursor store operation failed");
                    ApiError::InternalServerError(store.to_string())
                }
            },
            StreamError::Serialization(e) => ApiError::BadRequest(e.to_string()),
            other => {
                tracing::error!(error = %other, "cursor failed");
                ApiError::InternalServerError(other.to_string())
            }
        }
    }
}

/// Runs a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))?
        .map_err(ApiError::from)
}

pub(crate) fn parse_table(raw: &str) -> Result<TableName, ApiError> {
    TableName::new(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Parses the `where` query parameter and checks it renders.
pub(crate) fn parse_predicate(raw: Option<&str>) -> Result<Predicate, ApiError> {
    let predicate = match raw {
        Some(json) if !json.trim().is_empty() => serde_json::from_str::<Predicate>(json)
            .map_err(|e| ApiError::BadRequest(format!("invalid where clause: {}", e)))?,
        _ => Predicate::All,
    };
    predicate
        .to_sql()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(predicate)
}

/// Fails with 404 unless `table` has been provisioned.
pub(crate) async fn ensure_table(state: &AppState, table: &TableName) -> Result<(), ApiError> {
    let store = Arc::clone(state.feed.store());
    let tables = blocking(move || store.list_tables()).await?;
    if tables.iter().any(|info| info.name == table.as_str()) {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("table not found: {}", table)))
    }
}

/// Handler for `GET /api/tables`.
pub async fn list_tables_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<TableInfo>>, ApiError> {
    let store = Arc::clone(state.feed.store());
    let tables = blocking(move || store.list_tables()).await?;
    Ok(Json(tables))
}

/// Request body for `POST /api/tables/{table}`.
#[derive(Debug, Default, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub indexed_paths: Vec<String>,
}

/// Handler for `POST /api/tables/{table}`.
///
/// Idempotent; repeating the call with new paths adds their indexes.
pub async fn provision_table_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    body: Option<Json<ProvisionRequest>>,
) -> Result<Json<TableInfo>, ApiError> {
    let table = parse_table(&table)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let store = Arc::clone(state.feed.store());
    let name = table.clone();
    let tables = blocking(move || {
        store.provision_table(&name, &request.indexed_paths)?;
        store.list_tables()
    })
    .await?;

    tables
        .into_iter()
        .find(|info| info.name == table.as_str())
        .map(Json)
        .ok_or_else(|| ApiError::InternalServerError(format!("table {} missing after provisioning", table)))
}

/// Response body for `POST /api/tables/{table}/documents`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    pub id: i64,
}

/// Handler for `POST /api/tables/{table}/documents`.
pub async fn insert_document_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    Json(doc): Json<Value>,
) -> Result<(StatusCode, Json<InsertResponse>), ApiError> {
    let table = parse_table(&table)?;
    ensure_table(&state, &table).await?;

    let id = state.feed.add(&table, &doc).await?;
    tracing::debug!(%table, row_id = %id, "inserted document");
    Ok((StatusCode::CREATED, Json(InsertResponse { id: id.get() })))
}

/// Query parameters for `GET /api/tables/{table}/rows`.
#[derive(Debug, Deserialize)]
pub struct RowsParams {
    #[serde(rename = "where")]
    pub filter: Option<String>,
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<usize>,
}

/// Response body for `GET /api/tables/{table}/rows`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RowsResponse {
    pub rows: Vec<Row>,
    pub count: usize,
}

/// Handler for `GET /api/tables/{table}/rows`.
///
/// Drains a one-shot cursor, stopping early at `limit`.
pub async fn get_rows_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Query<RowsParams>,
) -> Result<Json<RowsResponse>, ApiError> {
    let table = parse_table(&table)?;
    let predicate = parse_predicate(params.filter.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_ROW_LIMIT).min(MAX_ROW_LIMIT);
    ensure_table(&state, &table).await?;

    let mut cursor = state
        .feed
        .get(&table, Filter::new(predicate).with_offset(params.offset));
    let mut rows = Vec::new();
    while rows.len() < limit {
        match cursor.recv().await {
            Some(row) => rows.push(row),
            None => {
                if let Some(err) = cursor.err() {
                    return Err(err.clone().into());
                }
                break;
            }
        }
    }
    cursor.close();

    let count = rows.len();
    Ok(Json(RowsResponse { rows, count }))
}
