//! Durable event wrapper: an [`Envelope`](crate::message::Envelope) as it
//! sits inside a stream, carrying the stream-relative ordinal it was
//! assigned on append.

use crate::message::Envelope;

/// An event as durably recorded in a stream: its envelope plus the
/// monotonic ordinal the store assigned it within that stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub stream_name: String,
    pub sequence_number: u64,
    pub envelope: Envelope,
}

impl PersistedEvent {
    pub fn new(stream_name: impl Into<String>, sequence_number: u64, envelope: Envelope) -> Self {
        PersistedEvent {
            stream_name: stream_name.into(),
            sequence_number,
            envelope,
        }
    }

    pub fn aggregate_version(&self) -> Option<u64> {
        self.envelope
            .metadata()
            .get(crate::error::metadata_keys::AGGREGATE_VERSION)
            .and_then(|v| v.parse().ok())
    }
}
