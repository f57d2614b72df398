//! docfeed server library logic.

pub mod api;
pub mod api_stream;
pub mod config;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use docfeed_db::{SqliteStore, StoreError};
use docfeed_stream::Feed;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Opens cursors and inserts documents.
    pub feed: Feed<SqliteStore>,
}

impl AppState {
    /// Opens the store, provisions the configured tables, and wraps the
    /// store in a feed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the database cannot be opened or a table
    /// cannot be provisioned.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = SqliteStore::open(&config.database.path, config.store_settings())?;
        for table in &config.tables {
            store.provision_table(&table.name, &table.indexed_paths)?;
        }
        Ok(Self {
            feed: Feed::with_settings(store, config.stream_settings()),
        })
    }
}

/// Maximum request body size (2 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tables", get(api::list_tables_handler))
        .route("/api/tables/{table}", post(api::provision_table_handler))
        .route(
            "/api/tables/{table}/documents",
            post(api::insert_document_handler),
        )
        .route("/api/tables/{table}/rows", get(api::get_rows_handler))
        .route(
            "/api/tables/{table}/stream",
            get(api_stream::get_row_stream_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
