//! Message codecs: pluggable (de)serialisation of an [`Envelope`] to and
//! from bytes, keyed by message name so a registered name can resolve to a
//! typed payload while everything else falls back to the generic map form.
//!
//! Two wire formats are provided behind Cargo features: [`json::JsonCodec`]
//! (self-describing, textual) and [`binary::BinaryCodec`] (a compact
//! Protocol-Buffers-style envelope, hand-written against `prost::Message`).

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::message::Envelope;

/// Errors raised while encoding or decoding a message through a [`Codec`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message {0:?}")]
    Encode(#[source] anyhow::Error),

    #[error("failed to decode message")]
    Decode(#[source] anyhow::Error),
}

/// Serialises an [`Envelope`] to bytes and reconstructs it, round-tripping
/// id, name, version, metadata and created timestamp (to at least
/// nanosecond precision) and data.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Envelope) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;
}

/// Process-wide table of message names known to carry a structured payload.
///
/// A name registered here round-trips its payload as [`crate::message::Payload::Structured`];
/// an unregistered name round-trips as [`crate::message::Payload::Generic`].
/// The open set of names is name-keyed, but the shape each name resolves to
/// is one of exactly two variants rather than an arbitrary struct.
#[derive(Default)]
pub struct CodecRegistry {
    structured: RwLock<HashMap<&'static str, ()>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name` as carrying a structured payload.
    pub fn register(&self, name: &'static str) {
        self.structured.write().expect("lock poisoned").insert(name, ());
    }

    pub fn is_structured(&self, name: &str) -> bool {
        self.structured.read().expect("lock poisoned").contains_key(name)
    }
}

#[cfg(feature = "serde-json")]
pub mod json {
    //! Self-describing textual codec: a top-level JSON object
    //! `{message_id, message_name, data, metadata, version, created_at}`
    //! with `created_at` as RFC3339 with nanosecond precision.

    use std::collections::HashMap;
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    use super::{Codec, CodecError, CodecRegistry};
    use crate::message::{Envelope, Metadata, Payload};

    #[derive(Serialize, Deserialize)]
    struct Wire {
        message_id: String,
        message_name: String,
        data: serde_json::Value,
        metadata: Metadata,
        version: u64,
        created_at: String,
    }

    /// A `serde_json`-backed textual [`Codec`].
    #[derive(Clone)]
    pub struct JsonCodec {
        registry: Arc<CodecRegistry>,
    }

    impl JsonCodec {
        pub fn new(registry: Arc<CodecRegistry>) -> Self {
            JsonCodec { registry }
        }
    }

    impl Codec for JsonCodec {
        fn encode(&self, message: &Envelope) -> Result<Vec<u8>, CodecError> {
            let wire = Wire {
                message_id: message.id().to_string(),
                message_name: message.name().to_string(),
                data: message.data().as_json(),
                metadata: message.metadata().clone(),
                version: message.version(),
                created_at: message
                    .created_at()
                    .format(&Rfc3339)
                    .map_err(|e| CodecError::Encode(e.into()))?,
            };
            serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.into()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
            let wire: Wire = serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.into()))?;
            let name: &'static str = crate::intern::intern(wire.message_name);
            let created_at = OffsetDateTime::parse(&wire.created_at, &Rfc3339)
                .map_err(|e| CodecError::Decode(e.into()))?;
            let data = if self.registry.is_structured(name) {
                Payload::Structured(wire.data)
            } else {
                Payload::Generic(json_object_to_string_map(wire.data))
            };
            Ok(Envelope::from_parts(
                wire.message_id,
                name,
                data,
                wire.metadata,
                wire.version,
                created_at,
            ))
        }
    }

    fn json_object_to_string_map(value: serde_json::Value) -> HashMap<String, String> {
        match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, s)
                })
                .collect(),
            _ => HashMap::new(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap as StdHashMap;

        #[test]
        fn round_trips_a_generic_event() {
            let codec = JsonCodec::new(Arc::new(CodecRegistry::new()));
            let mut meta = StdHashMap::new();
            meta.insert("aggregate_id".to_string(), "A".to_string());

            let original = Envelope::new_event(
                "thing-happened",
                Payload::Generic(StdHashMap::from([("foo".to_string(), "bar".to_string())])),
                3,
            )
            .with_metadata("aggregate_id", "A");

            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            assert_eq!(decoded.id(), original.id());
            assert_eq!(decoded.name(), original.name());
            assert_eq!(decoded.version(), original.version());
            assert_eq!(decoded.metadata(), original.metadata());
            assert_eq!(decoded.data(), original.data());
            assert_eq!(
                decoded.created_at().unix_timestamp_nanos(),
                original.created_at().unix_timestamp_nanos()
            );
        }

        #[test]
        fn unregistered_name_falls_back_to_generic_map() {
            let codec = JsonCodec::new(Arc::new(CodecRegistry::new()));
            let original = Envelope::new_command(
                "do-thing",
                Payload::Structured(serde_json::json!({"aggregate_id": "A", "by": 3})),
            );

            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            match decoded.data() {
                Payload::Generic(map) => {
                    assert_eq!(map.get("aggregate_id"), Some(&"A".to_string()));
                    assert_eq!(map.get("by"), Some(&"3".to_string()));
                }
                Payload::Structured(_) => panic!("expected generic payload for unregistered name"),
            }
        }

        #[test]
        fn registered_name_round_trips_as_structured() {
            let registry = Arc::new(CodecRegistry::new());
            registry.register("do-thing");
            let codec = JsonCodec::new(registry);

            let value = serde_json::json!({"aggregate_id": "A", "by": 3});
            let original = Envelope::new_command("do-thing", Payload::Structured(value.clone()));

            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            assert_eq!(decoded.data(), &Payload::Structured(value));
        }
    }
}

#[cfg(feature = "serde-prost")]
pub mod binary {
    //! Compact binary codec: a hand-written `prost::Message` envelope with
    //! the wire shape
    //! `{message_id, message_name, data: bytes, metadata: map<string, bytes>,
    //! version, created: {seconds, nanos}}`. Metadata is folded into a
    //! single `"__json"` entry holding the JSON-encoded metadata map, since
    //! `prost`'s map values do not nest further maps cleanly.

    use std::collections::HashMap;
    use std::sync::Arc;

    use prost::Message;
    use prost_types::Timestamp;

    use super::{Codec, CodecError, CodecRegistry};
    use crate::message::{Envelope, Payload};

    const METADATA_JSON_KEY: &str = "__json";

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct EnvelopeProto {
        #[prost(string, tag = "1")]
        message_id: String,
        #[prost(string, tag = "2")]
        message_name: String,
        #[prost(bytes = "vec", tag = "3")]
        data: Vec<u8>,
        #[prost(map = "string, bytes", tag = "4")]
        metadata: HashMap<String, Vec<u8>>,
        #[prost(uint64, tag = "5")]
        version: u64,
        #[prost(message, optional, tag = "6")]
        created: Option<Timestamp>,
    }

    /// A `prost`-backed compact binary [`Codec`].
    #[derive(Clone)]
    pub struct BinaryCodec {
        registry: Arc<CodecRegistry>,
    }

    impl BinaryCodec {
        pub fn new(registry: Arc<CodecRegistry>) -> Self {
            BinaryCodec { registry }
        }
    }

    impl Codec for BinaryCodec {
        fn encode(&self, message: &Envelope) -> Result<Vec<u8>, CodecError> {
            let data = serde_json::to_vec(&message.data().as_json()).map_err(|e| CodecError::Encode(e.into()))?;
            let metadata_json =
                serde_json::to_vec(message.metadata()).map_err(|e| CodecError::Encode(e.into()))?;
            let created = message.created_at();
            let proto = EnvelopeProto {
                message_id: message.id().to_string(),
                message_name: message.name().to_string(),
                data,
                metadata: HashMap::from([(METADATA_JSON_KEY.to_string(), metadata_json)]),
                version: message.version(),
                created: Some(Timestamp {
                    seconds: created.unix_timestamp(),
                    nanos: created.nanosecond() as i32,
                }),
            };
            Ok(proto.encode_to_vec())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
            let proto = EnvelopeProto::decode(bytes).map_err(|e| CodecError::Decode(e.into()))?;
            let name: &'static str = crate::intern::intern(proto.message_name);

            let metadata = match proto.metadata.get(METADATA_JSON_KEY) {
                Some(bytes) => serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.into()))?,
                None => Default::default(),
            };

            let value: serde_json::Value =
                serde_json::from_slice(&proto.data).map_err(|e| CodecError::Decode(e.into()))?;
            let data = if self.registry.is_structured(name) {
                Payload::Structured(value)
            } else {
                Payload::Generic(
                    value
                        .as_object()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| {
                            let s = match v {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            };
                            (k, s)
                        })
                        .collect(),
                )
            };

            let ts = proto.created.unwrap_or_default();
            let created_at = time::OffsetDateTime::from_unix_timestamp(ts.seconds)
                .map_err(|e| CodecError::Decode(e.into()))?
                + time::Duration::nanoseconds(ts.nanos as i64);

            Ok(Envelope::from_parts(
                proto.message_id,
                name,
                data,
                metadata,
                proto.version,
                created_at,
            ))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap as StdHashMap;

        #[test]
        fn round_trips_an_event_through_the_binary_envelope() {
            let codec = BinaryCodec::new(Arc::new(CodecRegistry::new()));
            let original = Envelope::new_event(
                "thing-happened",
                Payload::Generic(StdHashMap::from([("foo".to_string(), "bar".to_string())])),
                2,
            )
            .with_metadata("aggregate_id", "A");

            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            assert_eq!(decoded.name(), original.name());
            assert_eq!(decoded.version(), original.version());
            assert_eq!(decoded.metadata(), original.metadata());
            assert_eq!(decoded.data(), original.data());
        }
    }
}
