//! The immutable description of what a cursor streams.

use docfeed_db::Predicate;

/// Which rows a cursor delivers, and whether it keeps tailing.
///
/// The predicate is passed through untouched to both the backfill query
/// and the live-tail re-check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Rows must satisfy this predicate.
    pub predicate: Predicate,
    /// Number of leading historical matches to skip.
    pub offset: u64,
    /// Keep delivering new matches after the backfill.
    pub live_tail: bool,
}

impl Filter {
    /// A one-shot filter over `predicate`.
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            offset: 0,
            live_tail: false,
        }
    }

    /// Skips the first `offset` historical matches.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Keeps tailing new matches after the backfill.
    pub fn live(mut self) -> Self {
        self.live_tail = true;
        self
    }
}
