//! Error types for the document store.

use crate::migrations::MigrationError;
use crate::pool::PoolError;
use crate::predicate::PredicateError;
use docfeed_types::IdentifierError;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be checked out.
    #[error("store connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The connection pool could not be built.
    #[error(transparent)]
    PoolInit(#[from] PoolError),

    /// Schema migrations failed while opening the store.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// JSON serialization or deserialization of a document failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A predicate could not be rendered to SQL.
    #[error("invalid predicate: {0}")]
    Predicate(#[from] PredicateError),

    /// A table name or channel prefix was not a valid identifier.
    #[error("invalid identifier: {0}")]
    Identifier(#[from] IdentifierError),
}
