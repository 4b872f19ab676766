//! The cursor-based iteration contract shared by every event-store backend.
//!
//! An explicit `Fresh -> Advancing -> AtEnd/Closed` cursor with a
//! `rewind`/`close` lifecycle, rather than a plain stream: callers own their
//! own cursor and step it at their own pace, forward or in reverse.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::IteratorError;
use crate::event::PersistedEvent;

/// Lifecycle state of an [`EventIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Fresh,
    Advancing,
    AtEnd,
    Closed,
}

/// A cursor over a (possibly filtered) slice of a stream's events.
///
/// Implementations snapshot their source at construction so that concurrent
/// appends do not affect an in-flight iterator (see `crate::store` in-memory
/// backend docs). `next` returns `Err(IteratorError::EndOfStream)` once
/// exhausted; this is a sentinel, not a failure condition, and callers are
/// expected to match on it to terminate a loop.
#[async_trait]
pub trait EventIterator: Send {
    /// Advances the cursor and returns the next matching event, or
    /// `Err(IteratorError::EndOfStream)` if none remain. A `token` already
    /// cancelled, or cancelled while the backend is fetching more events,
    /// yields `Err(IteratorError::Cancelled)` instead — a distinct sentinel
    /// from `EndOfStream`.
    async fn next(&mut self, token: &CancellationToken) -> Result<PersistedEvent, IteratorError>;

    /// Resets the cursor to `Fresh`. Backends that cannot cheaply re-query
    /// MAY return `Err(IteratorError::RewindUnsupported)`.
    async fn rewind(&mut self, token: &CancellationToken) -> Result<(), IteratorError>;

    /// Releases backend resources. Idempotent; after this call every other
    /// operation returns `Err(IteratorError::Closed)`.
    async fn close(&mut self);

    fn state(&self) -> IteratorState;
}
