//! Error types for cursors and the feed.

use std::sync::Arc;

use docfeed_db::{StoreError, SubscriptionError};

/// Terminal errors observed by a cursor's background tasks.
///
/// Cancellation is never an error. The first error observed by either task
/// is kept and surfaced through [`crate::Cursor::err`]; later ones are
/// discarded. Errors are cheap to clone so the same value can be handed to
/// every observer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// A store operation failed during the scan, the re-check, the insert,
    /// or the subscription.
    #[error("store error: {0}")]
    Store(#[source] Arc<StoreError>),

    /// A notification payload was not the decimal ID of a row.
    #[error("malformed notification on channel '{channel}': {payload:?}")]
    MalformedNotification {
        /// The channel the notification arrived on.
        channel: String,
        /// The raw payload.
        payload: String,
    },

    /// The notification channel shut down. Falling behind is recovered from
    /// and never surfaces here.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// A document could not be serialized for insertion.
    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// A background task panicked or was aborted.
    #[error("cursor task failed: {0}")]
    TaskFailed(String),
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        Self::Store(Arc::new(err))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
