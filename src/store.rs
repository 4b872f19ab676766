//! The event store interface: create/append/delete streams, iterate forward
//! or in reverse with a metadata matcher, and discover stream names.
//!
//! Every method takes a leading `&CancellationToken`, so a caller's
//! cancellation propagates to whichever backend operation is currently
//! blocking — a call already cancelled on entry fails fast with
//! `StoreError::Cancelled` before any backend work starts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::iterator::EventIterator;
use crate::matcher::Matcher;
use crate::message::{Envelope, Metadata};

/// `count == 0` means "no limit".
pub const NO_LIMIT: u64 = 0;

/// Every operation takes a leading [`CancellationToken`]: a token already
/// cancelled on entry MUST fail fast with `StoreError::Cancelled` rather than
/// perform any backend work.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates a new stream with the given name, metadata and initial
    /// events, atomically. Fails with `StreamAlreadyExists` if the name is
    /// already in use; if the initial append fails the creation is rolled
    /// back.
    async fn create(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
        initial_events: Vec<Envelope>,
    ) -> Result<(), StoreError>;

    /// Appends events to an existing stream, atomically. Fails with
    /// `StreamDoesNotExist` if unknown, or `VersionConflict` if any event's
    /// `(aggregate_id, aggregate_version)` pair already exists.
    async fn append_to(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        events: Vec<Envelope>,
    ) -> Result<(), StoreError>;

    /// Deletes a stream and all its events. Idempotent: deleting an already
    /// absent stream succeeds.
    async fn delete(&self, token: &CancellationToken, stream_name: &str) -> Result<(), StoreError>;

    /// Opens a forward iterator starting at the `from`-th event (0-indexed
    /// over the *unfiltered* sequence), yielding at most `count` matching
    /// events (`0` = no limit).
    async fn load(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError>;

    /// Opens a reverse iterator: skips the first `from` matching events from
    /// the tail, then yields up to `count` further matching events toward
    /// the head.
    async fn load_reverse(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError>;

    /// Lists stream names containing `substring`, whose stream metadata
    /// satisfies `matcher`, paginated by `offset`/`limit` in creation order.
    async fn fetch_stream_names(
        &self,
        token: &CancellationToken,
        substring: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError>;

    /// As [`EventStore::fetch_stream_names`] but `pattern` is a regular
    /// expression matched against the full stream name.
    async fn fetch_stream_names_regex(
        &self,
        token: &CancellationToken,
        pattern: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError>;

    async fn fetch_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
    ) -> Result<Metadata, StoreError>;

    async fn update_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError>;
}
