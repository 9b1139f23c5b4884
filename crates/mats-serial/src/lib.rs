//! # mats-serial: Serializer port for the Mats messaging runtime
//!
//! Turns envelopes into byte sequences and back ([`MatsSerializer`]), and
//! user DTOs into the opaque payload model and back ([`serialize_object`],
//! [`deserialize_object`]). The opaque payload model is [`serde_json::Value`]:
//! calls and state frames carry `Value`s, and typed stage lambdas convert at
//! the edge.
//!
//! Serialization returns `(bytes, meta)`; `meta` records the body format and
//! compression codec and must be echoed back on deserialization. Bodies above
//! a size threshold are compressed (LZ4 by default, Zstandard available),
//! and the codec named in the meta is what deserialization uses.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use mats_trace::MatsTrace;

mod json;

pub use json::{CompressionKind, MatsSerializerJson};

/// Result type for serializer operations.
pub type SerialResult<T> = Result<T, SerializationError>;

/// Errors from envelope or DTO (de)serialization.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Envelope encoding failed.
    #[error("envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Envelope decoding failed.
    #[error("envelope decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A user DTO could not be converted to or from the opaque payload model.
    #[error("user object conversion failed: {0}")]
    Object(#[source] serde_json::Error),

    /// The meta string did not name a known format/codec combination.
    #[error("unrecognized serializer meta {0:?}")]
    UnknownMeta(String),

    /// Compression failed.
    #[error("compression failed ({codec}): {reason}")]
    CompressionFailed {
        /// Codec name.
        codec: &'static str,
        /// Underlying failure.
        reason: String,
    },

    /// Decompression failed.
    #[error("decompression failed ({codec}): {reason}")]
    DecompressionFailed {
        /// Codec name.
        codec: &'static str,
        /// Underlying failure.
        reason: String,
    },
}

/// A serialized envelope plus the meta needed to reverse it.
#[derive(Debug, Clone)]
pub struct SerializedTrace {
    /// The (possibly compressed) envelope body.
    pub bytes: Vec<u8>,
    /// Format + codec descriptor, echoed back on deserialization.
    pub meta: String,
    /// Body size before compression.
    pub size_plain: usize,
    /// Body size as it goes on the wire.
    pub size_wire: usize,
}

/// Envelope ↔ bytes port.
///
/// Implementations are shared across all processors and initiators of a
/// factory and must be thread-safe.
pub trait MatsSerializer: Send + Sync {
    /// Serializes the envelope, compressing when worthwhile.
    fn serialize_trace(&self, trace: &MatsTrace) -> SerialResult<SerializedTrace>;

    /// Reconstructs an envelope from `bytes` using the `meta` returned by
    /// [`serialize_trace`](Self::serialize_trace).
    fn deserialize_trace(&self, bytes: &[u8], meta: &str) -> SerialResult<MatsTrace>;
}

/// Converts a user DTO into the opaque payload model.
pub fn serialize_object<T: Serialize>(value: &T) -> SerialResult<Value> {
    serde_json::to_value(value).map_err(SerializationError::Object)
}

/// Converts an opaque payload back into a user DTO.
pub fn deserialize_object<T: DeserializeOwned>(value: Value) -> SerialResult<T> {
    serde_json::from_value(value).map_err(SerializationError::Object)
}

/// Materializes an empty instance for stage 0 when no state was supplied.
pub fn new_instance<T: Default>() -> T {
    T::default()
}

/// Resolves an incoming state frame into a typed state: an absent or null
/// frame yields the empty instance.
pub fn deserialize_state<T: DeserializeOwned + Default>(value: Option<&Value>) -> SerialResult<T> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => deserialize_object(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct OrderState {
        count: u32,
        note: String,
    }

    #[test]
    fn object_round_trip() {
        let state = OrderState {
            count: 3,
            note: "hi".to_string(),
        };
        let value = serialize_object(&state).unwrap();
        let back: OrderState = deserialize_object(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn absent_state_yields_empty_instance() {
        let state: OrderState = deserialize_state(None).unwrap();
        assert_eq!(state, OrderState::default());

        let state: OrderState = deserialize_state(Some(&Value::Null)).unwrap();
        assert_eq!(state, OrderState::default());
    }

    #[test]
    fn mismatched_object_is_an_error() {
        let value = serde_json::json!("not an object");
        let result: SerialResult<OrderState> = deserialize_object(value);
        assert!(matches!(result, Err(SerializationError::Object(_))));
    }
}
