//! Calls, channels and state frames: the building blocks of a trace.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Timestamp;

/// Whether a channel is consumed by exactly one receiver or fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessagingModel {
    /// Point-to-point: one message, one consumer.
    Queue,
    /// Publish/subscribe: every current subscriber gets a copy.
    Topic,
}

/// A named destination a call can be addressed to.
///
/// The `id` is the logical endpoint or stage id; the broker-level destination
/// name is derived from it by the runtime's configured prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Logical endpoint or stage id.
    pub id: String,
    /// Queue or topic.
    pub model: MessagingModel,
}

impl Channel {
    /// Creates a queue-model channel.
    pub fn queue(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Queue,
        }
    }

    /// Creates a topic-model channel.
    pub fn topic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Topic,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.model {
            MessagingModel::Queue => write!(f, "{}", self.id),
            MessagingModel::Topic => write!(f, "topic:{}", self.id),
        }
    }
}

/// The kind of hop a call represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// Invoke another endpoint, pushing a return address onto the stack.
    Request,
    /// Return to the channel on top of the stack, popping it.
    Reply,
    /// Pass to the next stage of the same endpoint; stack unchanged.
    Next,
    /// Fire-and-forget to a queue or topic; stack unchanged.
    Send,
}

/// One hop of a flow.
///
/// The `stack` is the sequence of return addresses as it stands *after* this
/// call, deepest first. Its length is the call's height, which is the key
/// used to look up the receiver's state frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// What kind of hop this is.
    pub kind: CallKind,
    /// The stage or initiator that produced this call.
    pub from: String,
    /// The channel this call is addressed to.
    pub to: Channel,
    /// The user payload. `None` once pruned from history (COMPACT/MINIMAL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Return addresses, deepest first.
    pub stack: Vec<Channel>,
    /// When the producing side added this call.
    pub timestamp: Timestamp,
    /// Call-site description ("app;version;host"), for debugging only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

impl Call {
    /// Stack depth after this call.
    pub fn height(&self) -> usize {
        self.stack.len()
    }
}

/// A piece of endpoint state, valid at one stack height.
///
/// The state visible to a stage executing at height `h` is the most recent
/// frame with `height == h`. Frames at greater heights belong to deeper,
/// already-returned branches; frames at lesser heights belong to outer
/// continuations and must survive until those return addresses are popped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFrame {
    /// The stack depth at which this state applies.
    pub height: usize,
    /// Opaque serialized endpoint state.
    pub state: Value,
}

impl StateFrame {
    /// Creates a frame binding `state` to `height`.
    pub fn new(height: usize, state: Value) -> Self {
        Self { height, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_constructors() {
        let q = Channel::queue("orders.place");
        assert_eq!(q.model, MessagingModel::Queue);
        assert_eq!(q.id, "orders.place");

        let t = Channel::topic("audit.events");
        assert_eq!(t.model, MessagingModel::Topic);
    }

    #[test]
    fn channel_display_marks_topics() {
        assert_eq!(Channel::queue("a.b").to_string(), "a.b");
        assert_eq!(Channel::topic("a.b").to_string(), "topic:a.b");
    }

    #[test]
    fn call_height_is_stack_len() {
        let call = Call {
            kind: CallKind::Request,
            from: "caller".to_string(),
            to: Channel::queue("svc"),
            data: None,
            stack: vec![Channel::queue("t1"), Channel::queue("t2")],
            timestamp: Timestamp::from_millis(0),
            debug_info: None,
        };
        assert_eq!(call.height(), 2);
    }
}
