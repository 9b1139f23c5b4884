//! Message representation and wire-key scheme.

use std::collections::HashMap;

use crate::Destination;

/// Header carrying the flow's trace id, mirroring the envelope.
pub const TRACE_ID_HEADER: &str = "mats:traceid";

/// Header carrying the per-message system id.
pub const MSG_ID_HEADER: &str = "mats:msgid";

/// Broker delivery priority.
///
/// Interactive flows are sent [`Priority::High`] so they overtake batch
/// traffic; everything else rides [`Priority::Normal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// Default delivery priority.
    #[default]
    Normal,
    /// Elevated priority for interactive flows.
    High,
}

/// A message as handed to [`Session::send`](crate::Session::send).
///
/// The body is two keyed maps: binary values and string values. The envelope
/// occupies the configured trace key in the bytes map; its serializer meta
/// and the side-channel payloads occupy sibling keys (see [`WireKeys`]) so
/// they never re-encode through the user-DTO path.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    /// String headers (trace id, message id).
    pub headers: HashMap<String, String>,
    /// Keyed binary body values.
    pub bytes: HashMap<String, Vec<u8>>,
    /// Keyed string body values.
    pub strings: HashMap<String, String>,
    /// Whether the broker should write the message durably.
    pub persistent: bool,
    /// Delivery priority.
    pub priority: Priority,
}

impl OutgoingMessage {
    /// Creates an empty persistent, normal-priority message.
    pub fn new() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }
}

/// A message as returned from [`Consumer::receive`](crate::Consumer::receive).
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The destination the message was consumed from.
    pub destination: Destination,
    /// String headers.
    pub headers: HashMap<String, String>,
    /// Keyed binary body values.
    pub bytes: HashMap<String, Vec<u8>>,
    /// Keyed string body values.
    pub strings: HashMap<String, String>,
    /// Whether the message was sent durably.
    pub persistent: bool,
    /// Delivery priority.
    pub priority: Priority,
}

/// Derives the body keys for the envelope, its meta, and the side channels
/// from the configured trace key (default `"mats:trace"`).
#[derive(Debug, Clone)]
pub struct WireKeys {
    trace: String,
    meta: String,
}

impl WireKeys {
    /// Creates the key scheme for a configured trace key.
    pub fn new(trace_key: &str) -> Self {
        Self {
            trace: trace_key.to_string(),
            meta: format!("{trace_key}:meta"),
        }
    }

    /// Key of the serialized envelope in the bytes map.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    /// Key of the serializer meta in the strings map.
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// Key of a named binary side-channel value in the bytes map.
    pub fn side_bytes(&self, key: &str) -> String {
        format!("{}:bytes:{key}", self.trace)
    }

    /// Key of a named string side-channel value in the strings map.
    pub fn side_string(&self, key: &str) -> String {
        format!("{}:strings:{key}", self.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_namespace_under_trace_key() {
        let keys = WireKeys::new("mats:trace");
        assert_eq!(keys.trace(), "mats:trace");
        assert_eq!(keys.meta(), "mats:trace:meta");
        assert_eq!(keys.side_bytes("doc"), "mats:trace:bytes:doc");
        assert_eq!(keys.side_string("who"), "mats:trace:strings:who");
    }

    #[test]
    fn outgoing_message_defaults_to_persistent() {
        let msg = OutgoingMessage::new();
        assert!(msg.persistent);
        assert_eq!(msg.priority, Priority::Normal);
    }
}
