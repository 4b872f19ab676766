//! Error taxonomy shared across the event store, aggregate engine, buses and
//! projection runtime. Every public error enum in this crate is built from
//! these building blocks so that callers can match on a small, stable set of
//! kinds regardless of which backend produced them.

use thiserror::Error;

/// Reserved metadata keys understood by the store, the aggregate engine and
/// the event-store bridge. Application code should treat these as read-only.
pub mod metadata_keys {
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const AGGREGATE_VERSION: &str = "aggregate_version";
    pub const CAUSATION_ID: &str = "causation_id";
    pub const CORRELATION_ID: &str = "correlation_id";
}

/// Errors that can occur while interacting with an [`crate::store::EventStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream {0:?} does not exist")]
    StreamDoesNotExist(String),

    #[error("stream {0:?} already exists")]
    StreamAlreadyExists(String),

    #[error("version conflict on aggregate {aggregate_id:?}: expected {expected}, got {actual}")]
    VersionConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Sentinel returned by an [`crate::iterator::EventIterator`] when there is
/// nothing left to read. Not a failure: callers typically match on this to
/// end a loop or fall asleep until more events arrive.
#[derive(Debug, Error)]
pub enum IteratorError {
    #[error("end of stream")]
    EndOfStream,

    #[error("iterator is closed")]
    Closed,

    #[error("backend does not support rewinding this iterator")]
    RewindUnsupported,

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while reconstituting or committing an aggregate.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregate history is corrupted: expected version {expected}, found {found}")]
    CorruptedHistory { expected: u64, found: u64 },

    #[error("command payload does not carry a usable aggregate id")]
    InvalidCommandPayload,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Iterator(#[from] IteratorError),

    #[error("aggregate state handler failed: {0}")]
    State(#[source] anyhow::Error),
}

/// Errors raised by the command bus.
#[derive(Debug, Error)]
pub enum CommandBusError {
    #[error("no handler registered for message {0:?}")]
    NoHandlerFound(String),

    #[error("a handler is already registered for message {0:?}")]
    HandlerAlreadyRegistered(String),

    #[error("dispatch of message {message_name:?} ({message_id}) failed: {source}")]
    DispatchFailed {
        message_id: String,
        message_name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Raised by [`crate::bridge`] when code expects an event store to already be
/// present in the dispatch context and it is not.
#[derive(Debug, Error)]
#[error("no event store found in the dispatch context")]
pub struct MissingEventStoreInContext;

/// Errors raised by the projection runtime: the manager's projection-record
/// store, and the projector loop that reads from an [`crate::store::EventStore`].
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("no projection registered named {0:?}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Iterator(#[from] IteratorError),

    #[error("projection handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("operation was cancelled")]
    Cancelled,
}
