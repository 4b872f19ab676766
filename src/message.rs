//! The message model: the immutable envelope shared by commands and events.
//!
//! A single [`Envelope`] carries both commands (`version == 0`) and events
//! (`version >= 1`), distinguished by the `version` field rather than by
//! separate wrapper types.

use std::collections::HashMap;
use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

/// String-keyed metadata carried alongside every message. Reserved keys are
/// listed in [`crate::error::metadata_keys`].
pub type Metadata = HashMap<String, String>;

/// The payload of a message: either a value the codec layer knows how to
/// decode into a concrete Rust type, or a generic string-keyed map for
/// messages whose name has no registered binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured(serde_json::Value),
    Generic(HashMap<String, String>),
}

impl Payload {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            Payload::Structured(v) => v.clone(),
            Payload::Generic(m) => {
                serde_json::to_value(m).expect("map of strings always serializes")
            }
        }
    }
}

/// An immutable message: a command (`version == 0`) or an event
/// (`version >= 1`), with its routing name, payload, metadata and creation
/// timestamp.
#[derive(Debug, Clone)]
pub struct Envelope {
    id: String,
    name: &'static str,
    data: Payload,
    metadata: Metadata,
    version: u64,
    created_at: OffsetDateTime,
}

impl Envelope {
    /// Builds a new command envelope (`version == 0`).
    pub fn new_command(name: &'static str, data: Payload) -> Self {
        Self::new(name, data, Metadata::new(), 0)
    }

    /// Builds a new event envelope with the given aggregate version
    /// (`version >= 1`).
    pub fn new_event(name: &'static str, data: Payload, version: u64) -> Self {
        debug_assert!(version >= 1, "events must carry a version of 1 or more");
        Self::new(name, data, Metadata::new(), version)
    }

    fn new(name: &'static str, data: Payload, metadata: Metadata, version: u64) -> Self {
        Envelope {
            id: Uuid::new_v4().to_string(),
            name,
            data,
            metadata,
            version,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn is_command(&self) -> bool {
        self.version == 0
    }

    pub fn is_event(&self) -> bool {
        self.version >= 1
    }

    /// Returns a copy of this envelope with the given metadata key set.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns a copy of this envelope with its version replaced.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Reconstructs an envelope from raw parts. Used by codecs deserialising
    /// a wire message back into an [`Envelope`].
    pub fn from_parts(
        id: String,
        name: &'static str,
        data: Payload,
        metadata: Metadata,
        version: u64,
        created_at: OffsetDateTime,
    ) -> Self {
        Envelope {
            id,
            name,
            data,
            metadata,
            version,
            created_at,
        }
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.metadata
            .get(crate::error::metadata_keys::AGGREGATE_ID)
            .map(String::as_str)
    }
}

/// Equality ignores `id` and `created_at`: two envelopes with the same name,
/// data, metadata and version are considered equal for test assertions.
/// Metadata participates because matcher-driven tests rely on it.
impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.data == other.data
            && self.metadata == other.metadata
            && self.version == other.version
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} (v{})", self.name, self.id, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Payload {
        Payload::Generic(HashMap::from([("foo".to_string(), "bar".to_string())]))
    }

    #[test]
    fn equality_ignores_id_and_timestamp() {
        let a = Envelope::new_event("thing-happened", payload(), 1);
        let b = Envelope::new_event("thing-happened", payload(), 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn command_has_version_zero() {
        let cmd = Envelope::new_command("do-thing", payload());
        assert!(cmd.is_command());
        assert!(!cmd.is_event());
    }

    #[test]
    fn with_metadata_is_additive() {
        let e = Envelope::new_event("thing-happened", payload(), 1)
            .with_metadata("aggregate_id", "A")
            .with_metadata("causation_id", "C");
        assert_eq!(e.metadata().len(), 2);
        assert_eq!(e.aggregate_id(), Some("A"));
    }
}
