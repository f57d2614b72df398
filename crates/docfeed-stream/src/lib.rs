//! Ordered document streams for docfeed.
//!
//! A [`Feed`] turns a document table into a single ordered stream of rows:
//! a paginated replay of the matching history, optionally followed by a
//! live tail of new inserts. Each [`Cursor`] is driven by two tasks.
//!
//! - The **history** task pages through existing rows in ID order and
//!   forwards them to the consumer, then drains the live backlog.
//! - The **listener** task subscribes to the table's insert notifications,
//!   re-checks every notified row against the filter, and queues matches in
//!   the backlog while the replay is still running. If it falls behind the
//!   notification channel, it recovers the missed rows from the table.
//!
//! The listener subscribes before the replay starts, so no insert can slip
//! between the two. Rows that land in both are delivered once.
//!
//! Closing a cursor cancels both tasks; an error in either one cancels the
//! other and is reported through [`Cursor::err`].

mod cursor;
mod error;
mod feed;
mod filter;
mod history;
mod listener;
mod settings;
mod store;

pub use cursor::{Cursor, CursorCloser, CursorState};
pub use error::StreamError;
pub use feed::Feed;
pub use filter::Filter;
pub use settings::StreamSettings;
pub use store::Store;

pub use docfeed_db::Predicate;
pub use docfeed_types::{Row, RowId, TableName};
