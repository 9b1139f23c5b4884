//! The per-invocation context handed to stage lambdas.

use anyhow::bail;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use mats_broker::{Destination, IncomingMessage, OutgoingMessage};
use mats_trace::MatsTrace;

use crate::endpoint::Stage;
use crate::error::MatsResult;
use crate::factory::FactoryInner;
use crate::initiator::InitiateContext;

/// What a stage asked to emit; materialized into envelopes after the lambda
/// returns, so every outbound state frame carries the lambda's *final*
/// endpoint state.
pub(crate) enum OutboundIntent {
    Reply {
        data: Value,
    },
    Request {
        to: String,
        data: Value,
        initial_state: Option<Value>,
    },
    Next {
        data: Value,
    },
    Publish {
        to: String,
        data: Value,
        initial_state: Option<Value>,
    },
    Initiate {
        messages: Vec<(Destination, OutgoingMessage)>,
    },
}

/// Context for one stage execution.
///
/// Exposes the flow's identity and side channels, and the outbound emitters:
/// [`reply`](Self::reply), [`request`](Self::request), [`next`](Self::next),
/// [`publish`](Self::publish) and [`initiate`](Self::initiate). Emissions
/// are collected and sent atomically with the receive in the surrounding
/// transaction; a lambda failure discards them all.
pub struct ProcessContext<'a> {
    pub(crate) inner: &'a FactoryInner,
    pub(crate) stage: &'a Stage,
    pub(crate) trace: &'a MatsTrace,
    pub(crate) message: &'a IncomingMessage,
    pub(crate) intents: Vec<OutboundIntent>,
    pub(crate) prop_updates: Vec<(String, Value)>,
    pub(crate) out_bytes: Vec<(String, Vec<u8>)>,
    pub(crate) out_strings: Vec<(String, String)>,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(
        inner: &'a FactoryInner,
        stage: &'a Stage,
        trace: &'a MatsTrace,
        message: &'a IncomingMessage,
    ) -> Self {
        Self {
            inner,
            stage,
            trace,
            message,
            intents: Vec::new(),
            prop_updates: Vec::new(),
            out_bytes: Vec::new(),
            out_strings: Vec::new(),
        }
    }

    /// The flow's trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    /// The endpoint this stage belongs to.
    pub fn endpoint_id(&self) -> &str {
        &self.stage.endpoint_id
    }

    /// This stage's id.
    pub fn stage_id(&self) -> &str {
        &self.stage.id
    }

    /// Whether the flow rides elevated broker priority.
    pub fn is_interactive(&self) -> bool {
        self.trace.interactive
    }

    /// Whether the flow skips durable broker writes.
    pub fn is_non_persistent(&self) -> bool {
        self.trace.non_persistent
    }

    /// The inbound envelope, for diagnostics.
    pub fn trace(&self) -> &MatsTrace {
        self.trace
    }

    /// Reads a named binary side-channel value off the incoming message.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.message
            .bytes
            .get(&self.inner.wire_keys.side_bytes(key))
            .map(Vec::as_slice)
    }

    /// Reads a named string side-channel value off the incoming message.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.message
            .strings
            .get(&self.inner.wire_keys.side_string(key))
            .map(String::as_str)
    }

    /// Attaches a named binary side-channel value to this stage's outbound
    /// messages.
    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.out_bytes.push((key.into(), value));
        self
    }

    /// Attaches a named string side-channel value to this stage's outbound
    /// messages.
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.out_strings.push((key.into(), value.into()));
        self
    }

    /// Reads a sticky flow property, seeing this stage's own writes first.
    pub fn trace_property<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let value = self
            .prop_updates
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.trace.trace_property(name));
        match value {
            Some(v) => Ok(Some(mats_serial::deserialize_object(v.clone())?)),
            None => Ok(None),
        }
    }

    /// Writes a sticky flow property, carried by every downstream hop.
    pub fn set_trace_property<T: Serialize>(&mut self, name: &str, value: &T) -> anyhow::Result<()> {
        let value = mats_serial::serialize_object(value)?;
        self.prop_updates.push((name.to_string(), value));
        Ok(())
    }

    /// Replies to the continuation on top of the flow's stack. With an empty
    /// stack the reply is silently dropped (observable via the factory's
    /// dropped-replies counter).
    pub fn reply<T: Serialize>(&mut self, reply: &T) -> anyhow::Result<()> {
        let data = mats_serial::serialize_object(reply)?;
        self.intents.push(OutboundIntent::Reply { data });
        Ok(())
    }

    /// Requests another endpoint; its eventual reply arrives at this
    /// endpoint's next stage, with this stage's final state restored.
    pub fn request<T: Serialize>(&mut self, endpoint_id: &str, dto: &T) -> anyhow::Result<()> {
        self.request_inner(endpoint_id, mats_serial::serialize_object(dto)?, None)
    }

    /// Like [`request`](Self::request), also seeding the callee's stage 0
    /// with an initial state.
    pub fn request_with_initial_state<T: Serialize, S: Serialize>(
        &mut self,
        endpoint_id: &str,
        dto: &T,
        initial_state: &S,
    ) -> anyhow::Result<()> {
        self.request_inner(
            endpoint_id,
            mats_serial::serialize_object(dto)?,
            Some(mats_serial::serialize_object(initial_state)?),
        )
    }

    /// Passes the flow to this endpoint's next stage, carrying this stage's
    /// final state.
    pub fn next<T: Serialize>(&mut self, dto: &T) -> anyhow::Result<()> {
        if self.stage.next_stage_id.is_none() {
            bail!(
                "stage '{}' is terminal: there is no next stage",
                self.stage.id
            );
        }
        let data = mats_serial::serialize_object(dto)?;
        self.intents.push(OutboundIntent::Next { data });
        Ok(())
    }

    /// Publishes to a topic; every live subscription terminator receives a
    /// copy. The flow's stack is unchanged.
    pub fn publish<T: Serialize>(&mut self, endpoint_id: &str, dto: &T) -> anyhow::Result<()> {
        let data = mats_serial::serialize_object(dto)?;
        self.intents.push(OutboundIntent::Publish {
            to: endpoint_id.to_string(),
            data,
            initial_state: None,
        });
        Ok(())
    }

    /// Like [`publish`](Self::publish) with an initial state for receivers.
    pub fn publish_with_initial_state<T: Serialize, S: Serialize>(
        &mut self,
        endpoint_id: &str,
        dto: &T,
        initial_state: &S,
    ) -> anyhow::Result<()> {
        let data = mats_serial::serialize_object(dto)?;
        self.intents.push(OutboundIntent::Publish {
            to: endpoint_id.to_string(),
            data,
            initial_state: Some(mats_serial::serialize_object(initial_state)?),
        });
        Ok(())
    }

    /// Starts a fresh nested flow within this stage's transaction. The new
    /// flow's trace id becomes `"<outer>|<inner>"`, and its messages commit
    /// (or roll back) together with this stage's own emissions.
    pub fn initiate<F>(&mut self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut InitiateContext<'_>) -> MatsResult<()>,
    {
        let mut init = InitiateContext::nested(self.inner, &self.stage.id, self.trace);
        f(&mut init)?;
        let messages = init.take_messages();
        self.intents.push(OutboundIntent::Initiate { messages });
        Ok(())
    }

    fn request_inner(
        &mut self,
        endpoint_id: &str,
        data: Value,
        initial_state: Option<Value>,
    ) -> anyhow::Result<()> {
        if self.stage.next_stage_id.is_none() {
            bail!(
                "stage '{}' is terminal: a request's reply would have no continuation",
                self.stage.id
            );
        }
        self.intents.push(OutboundIntent::Request {
            to: endpoint_id.to_string(),
            data,
            initial_state,
        });
        Ok(())
    }
}
