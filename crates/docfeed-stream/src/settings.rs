//! Cursor tunables.

use std::time::Duration;

/// Buffering, paging, and keepalive settings applied to every cursor a
/// [`crate::Feed`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Capacity of the consumer-facing output queue.
    pub output_capacity: usize,
    /// Capacity of the live-tail backlog held while the backfill runs.
    pub backlog_capacity: usize,
    /// Rows fetched per historical page.
    pub page_size: u64,
    /// Idle interval after which the listener pings the store.
    pub keepalive: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            output_capacity: 1024,
            backlog_capacity: 1024,
            page_size: 500,
            keepalive: Duration::from_secs(90),
        }
    }
}

impl StreamSettings {
    /// Clamps zero values that the channel and paging code cannot accept.
    pub(crate) fn normalized(self) -> Self {
        Self {
            output_capacity: self.output_capacity.max(1),
            backlog_capacity: self.backlog_capacity.max(1),
            page_size: self.page_size.max(1),
            keepalive: self.keepalive.max(Duration::from_millis(1)),
        }
    }
}
