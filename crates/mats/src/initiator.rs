//! Initiators: the entry point for non-stage code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

use mats_broker::{Destination, OutgoingMessage};
use mats_trace::{Channel, KeepTrace, MatsTrace};

use crate::error::{MatsError, MatsResult};
use crate::factory::FactoryInner;
use crate::transactions::{TxAttemptError, within_transaction};

/// A thread-safe, long-lived handle for initiating flows.
///
/// Obtained from [`MatsFactory::initiator`](crate::MatsFactory::initiator);
/// each [`initiate`](Self::initiate) checks a session out of the pool for
/// the duration of that one initiation and runs the full transactional
/// bracket around the supplied closure.
pub struct Initiator {
    name: String,
    inner: Arc<FactoryInner>,
    closed: AtomicBool,
}

impl Initiator {
    pub(crate) fn new(name: &str, inner: Arc<FactoryInner>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// This initiator's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one initiation. The closure configures a one-shot builder and
    /// fires one or more of its terminators (`request`, `send`, `publish`);
    /// everything staged commits atomically with the configured external
    /// resource, or not at all. The exception is the best-effort-1PC
    /// window, which surfaces as [`MatsError::MessageSend`].
    pub fn initiate<F>(&self, f: F) -> MatsResult<()>
    where
        F: FnOnce(&mut InitiateContext<'_>) -> MatsResult<()>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MatsError::Lifecycle(format!(
                "initiator '{}' is closed",
                self.name
            )));
        }

        let mut pooled = self
            .inner
            .pool
            .acquire()
            .map_err(MatsError::BackendUnavailable)?;

        let mut ctx = InitiateContext::top_level(&self.inner, &self.name);
        let result = within_transaction(
            pooled.session_mut(),
            self.inner.tx_manager.as_deref(),
            || {
                f(&mut ctx).map_err(anyhow::Error::from)?;
                Ok(ctx.take_messages())
            },
        );

        match result {
            Ok(()) => {
                pooled.release();
                Ok(())
            }
            Err(TxAttemptError::Retry(e)) => {
                pooled.release();
                Err(match e.downcast::<MatsError>() {
                    Ok(mats_error) => mats_error,
                    Err(other) => MatsError::Resource(other),
                })
            }
            Err(TxAttemptError::SessionLost(e)) => {
                pooled.crashed();
                Err(MatsError::BackendUnavailable(e))
            }
            Err(TxAttemptError::MessageSend(e)) => {
                pooled.crashed();
                Err(MatsError::MessageSend(e))
            }
        }
    }

    /// Closes the initiator; further initiations are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One-shot builder for a single initiation.
///
/// Required fields: `trace_id`, `from` and `to` for every terminator, plus
/// `reply_to` for [`request`](Self::request). A missing field fails the
/// terminator with [`MatsError::Validation`] before anything is staged.
pub struct InitiateContext<'a> {
    inner: &'a FactoryInner,
    initiator_id: String,
    parent: Option<&'a MatsTrace>,
    trace_id: Option<String>,
    keep_trace: KeepTrace,
    non_persistent: bool,
    interactive: bool,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<(String, Value)>,
    props: Vec<(String, Value)>,
    bytes: Vec<(String, Vec<u8>)>,
    strings: Vec<(String, String)>,
    messages: Vec<(Destination, OutgoingMessage)>,
}

impl<'a> InitiateContext<'a> {
    pub(crate) fn top_level(inner: &'a FactoryInner, initiator_id: &str) -> Self {
        Self::empty(inner, initiator_id.to_string(), None, None)
    }

    /// Builder for a flow initiated from within a stage: the stage is the
    /// default `from`, and the trace id is concatenated onto the parent's.
    pub(crate) fn nested(inner: &'a FactoryInner, stage_id: &str, parent: &'a MatsTrace) -> Self {
        Self::empty(
            inner,
            stage_id.to_string(),
            Some(parent),
            Some(stage_id.to_string()),
        )
    }

    fn empty(
        inner: &'a FactoryInner,
        initiator_id: String,
        parent: Option<&'a MatsTrace>,
        from: Option<String>,
    ) -> Self {
        Self {
            inner,
            initiator_id,
            parent,
            trace_id: None,
            keep_trace: KeepTrace::default(),
            non_persistent: false,
            interactive: false,
            from,
            to: None,
            reply_to: None,
            props: Vec::new(),
            bytes: Vec::new(),
            strings: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Sets the flow's correlation id. Required.
    pub fn trace_id(&mut self, trace_id: impl Into<String>) -> &mut Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the debug-retention policy (default COMPACT).
    pub fn keep_trace(&mut self, keep_trace: KeepTrace) -> &mut Self {
        self.keep_trace = keep_trace;
        self
    }

    /// Hints the broker to skip durable writes for every hop of the flow.
    pub fn non_persistent(&mut self) -> &mut Self {
        self.non_persistent = true;
        self
    }

    /// Rides elevated broker priority end-to-end.
    pub fn interactive(&mut self) -> &mut Self {
        self.interactive = true;
        self
    }

    /// Sets the logical origin label. Required.
    pub fn from(&mut self, from: impl Into<String>) -> &mut Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the target endpoint. Required.
    pub fn to(&mut self, to: impl Into<String>) -> &mut Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the terminator endpoint a request's final reply lands on, with
    /// the state that reply should carry. Required for
    /// [`request`](Self::request).
    pub fn reply_to<S: Serialize>(&mut self, endpoint_id: &str, state: &S) -> MatsResult<&mut Self> {
        let state = mats_serial::serialize_object(state)?;
        self.reply_to = Some((endpoint_id.to_string(), state));
        Ok(self)
    }

    /// Sets a sticky flow property.
    pub fn set_trace_property<T: Serialize>(&mut self, name: &str, value: &T) -> MatsResult<&mut Self> {
        let value = mats_serial::serialize_object(value)?;
        self.props.push((name.to_string(), value));
        Ok(self)
    }

    /// Attaches a named binary side-channel payload.
    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.bytes.push((key.into(), value));
        self
    }

    /// Attaches a named string side-channel payload.
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.strings.push((key.into(), value.into()));
        self
    }

    /// Terminator: request `to`, directing the final reply to `reply_to`.
    pub fn request<T: Serialize>(&mut self, dto: &T) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        self.stage_request(data, None)
    }

    /// Terminator: request with an initial state for the callee's stage 0.
    pub fn request_with_initial_state<T: Serialize, S: Serialize>(
        &mut self,
        dto: &T,
        initial_state: &S,
    ) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        let initial = mats_serial::serialize_object(initial_state)?;
        self.stage_request(data, Some(initial))
    }

    /// Terminator: fire-and-forget send to `to`.
    pub fn send<T: Serialize>(&mut self, dto: &T) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        self.stage_send(data, None, false)
    }

    /// Terminator: send with an initial state for the receiver.
    pub fn send_with_initial_state<T: Serialize, S: Serialize>(
        &mut self,
        dto: &T,
        initial_state: &S,
    ) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        let initial = mats_serial::serialize_object(initial_state)?;
        self.stage_send(data, Some(initial), false)
    }

    /// Terminator: publish to the topic endpoint `to`.
    pub fn publish<T: Serialize>(&mut self, dto: &T) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        self.stage_send(data, None, true)
    }

    /// Terminator: publish with an initial state for subscribers.
    pub fn publish_with_initial_state<T: Serialize, S: Serialize>(
        &mut self,
        dto: &T,
        initial_state: &S,
    ) -> MatsResult<()> {
        let data = mats_serial::serialize_object(dto)?;
        let initial = mats_serial::serialize_object(initial_state)?;
        self.stage_send(data, Some(initial), true)
    }

    pub(crate) fn take_messages(&mut self) -> Vec<(Destination, OutgoingMessage)> {
        std::mem::take(&mut self.messages)
    }

    fn stage_request(&mut self, data: Value, initial_state: Option<Value>) -> MatsResult<()> {
        let trace_id = self.trace_id.clone().ok_or(MatsError::Validation("traceId"))?;
        let from = self.from.clone().ok_or(MatsError::Validation("from"))?;
        let to = self.to.clone().ok_or(MatsError::Validation("to"))?;
        let (reply_to, reply_state) = self
            .reply_to
            .clone()
            .ok_or(MatsError::Validation("replyTo"))?;

        let trace = self.base_trace(&trace_id).add_request_call(
            &from,
            Channel::queue(to),
            data,
            Channel::queue(reply_to),
            reply_state,
            initial_state,
            Some(self.inner.debug_info()),
        );
        self.stage_message(&trace)
    }

    fn stage_send(
        &mut self,
        data: Value,
        initial_state: Option<Value>,
        topic: bool,
    ) -> MatsResult<()> {
        let trace_id = self.trace_id.clone().ok_or(MatsError::Validation("traceId"))?;
        let from = self.from.clone().ok_or(MatsError::Validation("from"))?;
        let to = self.to.clone().ok_or(MatsError::Validation("to"))?;

        let channel = if topic {
            Channel::topic(to)
        } else {
            Channel::queue(to)
        };
        let trace = self.base_trace(&trace_id).add_send_call(
            &from,
            channel,
            data,
            initial_state,
            Some(self.inner.debug_info()),
        );
        self.stage_message(&trace)
    }

    fn base_trace(&self, trace_id: &str) -> MatsTrace {
        let init = self.inner.initiator_meta(&self.initiator_id);
        let mut trace = match self.parent {
            Some(parent) => parent.nested(
                trace_id,
                self.keep_trace,
                self.non_persistent,
                self.interactive,
                init,
            ),
            None => MatsTrace::new(
                trace_id,
                self.keep_trace,
                self.non_persistent,
                self.interactive,
                init,
            ),
        };
        for (name, value) in &self.props {
            trace.set_trace_property(name.clone(), value.clone());
        }
        trace
    }

    fn stage_message(&mut self, trace: &MatsTrace) -> MatsResult<()> {
        let (destination, message) = self.inner.build_message(trace, &self.bytes, &self.strings)?;
        self.messages.push((destination, message));
        Ok(())
    }
}
