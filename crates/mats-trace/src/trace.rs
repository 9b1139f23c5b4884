//! The envelope: one [`MatsTrace`] per live flow.

use std::collections::HashSet;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Call, CallKind, Channel, StateFrame, Timestamp};

/// Debug-retention policy for the envelope.
///
/// Controls how much history a flow drags along. The observable flow
/// semantics (current call, current stack, visible state) are identical in
/// all three modes; only the retained history differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeepTrace {
    /// Keep every call with its payload and every state frame.
    Full,
    /// Keep all calls but null the payload of non-current calls; prune
    /// unreachable state frames.
    #[default]
    Compact,
    /// Keep only the current call; prune unreachable state frames.
    Minimal,
}

/// Who started the flow, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatorMeta {
    /// Application name of the initiating process.
    pub app_name: String,
    /// Application version of the initiating process.
    pub app_version: String,
    /// Hostname of the initiating process.
    pub host: String,
    /// The initiator id within the factory.
    pub initiator_id: String,
    /// When the flow was initiated.
    pub init_timestamp: Timestamp,
}

/// The per-flow wire envelope.
///
/// Created by an initiator (or by a stage's nested initiation) and carried in
/// every message of the flow. The envelope is never mutated in place by a
/// consumer: every outbound action clones it and applies one transition
/// ([`add_request_call`](Self::add_request_call) and friends), so the inbound
/// envelope a stage observes is structurally untouched by its own emissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatsTrace {
    /// Caller-supplied correlation id; immutable across the flow. A nested
    /// initiation from a stage appends its own id with a `|` separator.
    pub trace_id: String,
    /// Debug-retention policy.
    pub keep_trace: KeepTrace,
    /// Hint to the broker to skip the durable write for every hop.
    pub non_persistent: bool,
    /// Priority hint, propagated end-to-end.
    pub interactive: bool,
    /// Call history, oldest first. The last entry is the current call.
    pub call_flow: Vec<Call>,
    /// State history, oldest first.
    pub state_flow: Vec<StateFrame>,
    /// Ordered name → value properties, sticky for the entire flow.
    pub trace_props: Vec<(String, Value)>,
    /// Initiation metadata.
    pub init: InitiatorMeta,
}

impl MatsTrace {
    /// Creates a fresh envelope with no calls yet.
    pub fn new(
        trace_id: impl Into<String>,
        keep_trace: KeepTrace,
        non_persistent: bool,
        interactive: bool,
        init: InitiatorMeta,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            keep_trace,
            non_persistent,
            interactive,
            call_flow: Vec::new(),
            state_flow: Vec::new(),
            trace_props: Vec::new(),
            init,
        }
    }

    /// Creates the envelope for a flow initiated from within a stage of this
    /// flow. The child's trace id is `"<outer>|<inner>"`.
    pub fn nested(
        &self,
        inner_trace_id: &str,
        keep_trace: KeepTrace,
        non_persistent: bool,
        interactive: bool,
        init: InitiatorMeta,
    ) -> Self {
        Self::new(
            format!("{}|{}", self.trace_id, inner_trace_id),
            keep_trace,
            non_persistent,
            interactive,
            init,
        )
    }

    /// The call currently in flight, i.e. the one whose receiver is (about to
    /// be) processing. `None` only before the first call is added.
    pub fn current_call(&self) -> Option<&Call> {
        self.call_flow.last()
    }

    /// Stack depth of the current call; 0 before the first call.
    pub fn current_height(&self) -> usize {
        self.current_call().map_or(0, Call::height)
    }

    /// The state visible to the receiver of the current call.
    ///
    /// Walks the state flow newest-first for a frame whose height equals the
    /// current height. A frame *below* the target height ends the walk: no
    /// state was placed for this height on this branch, and the receiver
    /// starts from an empty state.
    pub fn current_state(&self) -> Option<&Value> {
        let height = self.current_height();
        for frame in self.state_flow.iter().rev() {
            if frame.height == height {
                return Some(&frame.state);
            }
            if frame.height < height {
                return None;
            }
        }
        None
    }

    /// Sets a sticky flow property, replacing any previous value of the same
    /// name while keeping the original insertion position.
    pub fn set_trace_property(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.trace_props.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.trace_props.push((name, value));
        }
    }

    /// Reads a sticky flow property.
    pub fn trace_property(&self, name: &str) -> Option<&Value> {
        self.trace_props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// REQUEST: push `push` (the caller's continuation channel) onto the
    /// stack, record `reply_state` for the continuation one level below the
    /// new top, optionally seed the callee with `initial_state`, and address
    /// the new call to `to`.
    pub fn add_request_call(
        &self,
        from: &str,
        to: Channel,
        data: Value,
        push: Channel,
        reply_state: Value,
        initial_state: Option<Value>,
        debug_info: Option<String>,
    ) -> MatsTrace {
        let mut next = self.clone();
        let mut stack = next.current_stack();
        let reply_height = stack.len();
        stack.push(push);
        next.prune_for_new_call(stack.len());
        next.state_flow.push(StateFrame::new(reply_height, reply_state));
        if let Some(state) = initial_state {
            next.state_flow.push(StateFrame::new(stack.len(), state));
        }
        next.push_call(CallKind::Request, from, to, Some(data), stack, debug_info);
        next
    }

    /// REPLY: pop the stack and address the call to the popped channel.
    ///
    /// Returns `None` when the stack is empty (a terminator replied): the
    /// reply is dropped without producing an envelope. Callers that want the
    /// drop to be observable count it themselves.
    pub fn add_reply_call(
        &self,
        from: &str,
        data: Value,
        debug_info: Option<String>,
    ) -> Option<MatsTrace> {
        let mut stack = self.current_stack();
        let to = stack.pop()?;
        let mut next = self.clone();
        next.prune_for_new_call(stack.len());
        next.push_call(CallKind::Reply, from, to, Some(data), stack, debug_info);
        Some(next)
    }

    /// NEXT: pass to the sibling stage `to` with `state`, stack unchanged.
    pub fn add_next_call(
        &self,
        from: &str,
        to: Channel,
        data: Value,
        state: Value,
        debug_info: Option<String>,
    ) -> MatsTrace {
        let mut next = self.clone();
        let stack = next.current_stack();
        next.prune_for_new_call(stack.len());
        next.state_flow.push(StateFrame::new(stack.len(), state));
        next.push_call(CallKind::Next, from, to, Some(data), stack, debug_info);
        next
    }

    /// SEND (queue) or PUBLISH (topic, by `to.model`): fire-and-forget with
    /// an optional initial state for the target, stack unchanged.
    pub fn add_send_call(
        &self,
        from: &str,
        to: Channel,
        data: Value,
        initial_state: Option<Value>,
        debug_info: Option<String>,
    ) -> MatsTrace {
        let mut next = self.clone();
        let stack = next.current_stack();
        next.prune_for_new_call(stack.len());
        if let Some(state) = initial_state {
            next.state_flow.push(StateFrame::new(stack.len(), state));
        }
        next.push_call(CallKind::Send, from, to, Some(data), stack, debug_info);
        next
    }

    fn current_stack(&self) -> Vec<Channel> {
        self.current_call().map(|c| c.stack.clone()).unwrap_or_default()
    }

    fn push_call(
        &mut self,
        kind: CallKind,
        from: &str,
        to: Channel,
        data: Option<Value>,
        stack: Vec<Channel>,
        debug_info: Option<String>,
    ) {
        self.call_flow.push(Call {
            kind,
            from: from.to_string(),
            to,
            data,
            stack,
            timestamp: Timestamp::now(),
            debug_info,
        });
    }

    /// History pruning, applied while the *next* call is being added.
    ///
    /// Running it at this point (not when the current call was received)
    /// means the receiving stage of the current call always saw its full
    /// payload; only the hop after it carries the nulled history.
    fn prune_for_new_call(&mut self, new_height: usize) {
        match self.keep_trace {
            KeepTrace::Full => {}
            KeepTrace::Compact => {
                self.drop_unreachable_states(new_height);
                for call in &mut self.call_flow {
                    call.data = None;
                }
            }
            KeepTrace::Minimal => {
                self.drop_unreachable_states(new_height);
                self.call_flow.clear();
            }
        }
    }

    /// Keeps, per height ≤ `new_height`, only the most recent state frame.
    /// Frames above `new_height` belong to branches that can no longer be
    /// reached and are dropped.
    fn drop_unreachable_states(&mut self, new_height: usize) {
        let mut seen = HashSet::new();
        let mut kept: Vec<StateFrame> = self
            .state_flow
            .iter()
            .rev()
            .filter(|f| f.height <= new_height && seen.insert(f.height))
            .cloned()
            .collect();
        kept.reverse();
        self.state_flow = kept;
    }
}

impl Display for MatsTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MatsTrace[traceId={}, keep={:?}, calls={}",
            self.trace_id,
            self.keep_trace,
            self.call_flow.len(),
        )?;
        if let Some(call) = self.current_call() {
            write!(f, ", current={:?} {} -> {} @h{}", call.kind, call.from, call.to, call.height())?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> InitiatorMeta {
        InitiatorMeta {
            app_name: "test-app".to_string(),
            app_version: "0.0.1".to_string(),
            host: "localhost".to_string(),
            initiator_id: "default".to_string(),
            init_timestamp: Timestamp::from_millis(1_000),
        }
    }

    fn fresh(keep: KeepTrace) -> MatsTrace {
        MatsTrace::new("t1", keep, false, false, meta())
    }

    #[test]
    fn request_pushes_continuation_and_records_reply_state() {
        let trace = fresh(KeepTrace::Full).add_request_call(
            "caller",
            Channel::queue("svc.double"),
            json!(21),
            Channel::queue("terminator"),
            json!({"corr": 7}),
            None,
            None,
        );

        let call = trace.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Request);
        assert_eq!(call.stack, vec![Channel::queue("terminator")]);
        assert_eq!(call.data, Some(json!(21)));

        // Reply state sits one level below the new top.
        assert_eq!(trace.state_flow, vec![StateFrame::new(0, json!({"corr": 7}))]);
        // The callee at height 1 has no state yet.
        assert_eq!(trace.current_state(), None);
    }

    #[test]
    fn request_with_initial_state_seeds_the_callee() {
        let trace = fresh(KeepTrace::Full).add_request_call(
            "caller",
            Channel::queue("svc"),
            json!(1),
            Channel::queue("term"),
            Value::Null,
            Some(json!({"seed": true})),
            None,
        );
        assert_eq!(trace.current_state(), Some(&json!({"seed": true})));
    }

    #[test]
    fn reply_pops_to_the_pushed_channel_and_restores_state() {
        let requested = fresh(KeepTrace::Full).add_request_call(
            "caller",
            Channel::queue("svc"),
            json!(10),
            Channel::queue("term"),
            json!({"seen": 10}),
            None,
            None,
        );
        let replied = requested
            .add_reply_call("svc", json!(20), None)
            .expect("stack is non-empty");

        let call = replied.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Reply);
        assert_eq!(call.to, Channel::queue("term"));
        assert!(call.stack.is_empty());

        // The requester's state is visible again at the restored height.
        assert_eq!(replied.current_state(), Some(&json!({"seen": 10})));
    }

    #[test]
    fn reply_on_empty_stack_is_dropped() {
        let trace = fresh(KeepTrace::Full).add_send_call(
            "caller",
            Channel::queue("terminator"),
            json!(1),
            None,
            None,
        );
        assert!(trace.add_reply_call("terminator", json!(2), None).is_none());
    }

    #[test]
    fn next_keeps_stack_and_carries_state() {
        let requested = fresh(KeepTrace::Full).add_request_call(
            "caller",
            Channel::queue("p"),
            json!(4),
            Channel::queue("term"),
            Value::Null,
            None,
            None,
        );
        let nexted = requested.add_next_call(
            "p",
            Channel::queue("p.stage1"),
            json!(4),
            json!({"acc": 3}),
            None,
        );

        let call = nexted.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Next);
        assert_eq!(call.stack, requested.current_call().unwrap().stack);
        assert_eq!(nexted.current_state(), Some(&json!({"acc": 3})));
    }

    #[test]
    fn send_leaves_stack_empty_and_state_optional() {
        let sent = fresh(KeepTrace::Full).add_send_call(
            "caller",
            Channel::queue("sink"),
            json!("x"),
            Some(json!({"init": 1})),
            None,
        );
        assert_eq!(sent.current_height(), 0);
        assert_eq!(sent.current_state(), Some(&json!({"init": 1})));
    }

    #[test]
    fn publish_is_send_to_a_topic() {
        let published = fresh(KeepTrace::Full).add_send_call(
            "caller",
            Channel::topic("evt.x"),
            json!({"id": 1}),
            None,
            None,
        );
        let call = published.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Send);
        assert_eq!(call.to.model, crate::MessagingModel::Topic);
    }

    #[test]
    fn transitions_do_not_mutate_the_source() {
        let source = fresh(KeepTrace::Compact).add_request_call(
            "caller",
            Channel::queue("svc"),
            json!(1),
            Channel::queue("term"),
            Value::Null,
            None,
            None,
        );
        let snapshot = source.clone();

        let _ = source.add_reply_call("svc", json!(2), None);
        let _ = source.add_next_call("svc", Channel::queue("svc.stage1"), json!(3), Value::Null, None);
        let _ = source.add_send_call("svc", Channel::queue("x"), json!(4), None, None);

        assert_eq!(source, snapshot);
    }

    #[test]
    fn compact_nulls_history_data_after_local_visibility() {
        // caller -req-> a -req-> b -reply-> a.stage1 -reply-> term: 4 hops.
        let t1 = fresh(KeepTrace::Compact).add_request_call(
            "caller",
            Channel::queue("a"),
            json!(1),
            Channel::queue("term"),
            Value::Null,
            None,
            None,
        );
        // Stage "a" sees its own payload in full.
        assert_eq!(t1.current_call().unwrap().data, Some(json!(1)));

        let t2 = t1.add_request_call(
            "a",
            Channel::queue("b"),
            json!(2),
            Channel::queue("a.stage1"),
            json!({"s": 1}),
            None,
            None,
        );
        let t3 = t2.add_reply_call("b", json!(3), None).unwrap();
        let t4 = t3.add_reply_call("a.stage1", json!(4), None).unwrap();

        assert_eq!(t4.call_flow.len(), 4);
        let datas: Vec<bool> = t4.call_flow.iter().map(|c| c.data.is_some()).collect();
        assert_eq!(datas, vec![false, false, false, true]);

        // Exactly one state frame per distinct height <= terminator's height.
        let mut heights: Vec<usize> = t4.state_flow.iter().map(|f| f.height).collect();
        let terminator_height = t4.current_height();
        heights.sort_unstable();
        heights.dedup();
        assert_eq!(heights.len(), t4.state_flow.len(), "duplicate heights survived pruning");
        assert!(t4.state_flow.iter().all(|f| f.height <= terminator_height));
    }

    #[test]
    fn minimal_keeps_only_the_current_call() {
        let t = fresh(KeepTrace::Minimal)
            .add_request_call(
                "caller",
                Channel::queue("a"),
                json!(1),
                Channel::queue("term"),
                Value::Null,
                None,
                None,
            )
            .add_reply_call("a", json!(2), None)
            .unwrap();

        assert_eq!(t.call_flow.len(), 1);
        assert_eq!(t.current_call().unwrap().kind, CallKind::Reply);
        assert_eq!(t.current_call().unwrap().data, Some(json!(2)));
    }

    #[test]
    fn full_mode_prunes_nothing() {
        let t = fresh(KeepTrace::Full)
            .add_request_call(
                "caller",
                Channel::queue("a"),
                json!(1),
                Channel::queue("term"),
                json!({"outer": 1}),
                Some(json!({"inner": 1})),
                None,
            )
            .add_reply_call("a", json!(2), None)
            .unwrap();

        assert_eq!(t.call_flow.len(), 2);
        assert!(t.call_flow[0].data.is_some());
        assert_eq!(t.state_flow.len(), 2);
    }

    #[test]
    fn state_lookup_stops_below_target_height() {
        // A frame below the current height means no state was placed for
        // this branch; the receiver starts empty even though deeper frames
        // exist further back in history.
        let mut t = fresh(KeepTrace::Full).add_request_call(
            "caller",
            Channel::queue("a"),
            json!(1),
            Channel::queue("term"),
            json!({"outer": true}),
            None,
            None,
        );
        // Synthetic older frame at a deeper height than current.
        t.state_flow.insert(0, StateFrame::new(5, json!({"stale": true})));
        assert_eq!(t.current_state(), None);
    }

    #[test]
    fn trace_properties_are_ordered_and_replaceable() {
        let mut t = fresh(KeepTrace::Full);
        t.set_trace_property("x", json!(1));
        t.set_trace_property("y", json!(2));
        t.set_trace_property("x", json!(3));

        assert_eq!(t.trace_property("x"), Some(&json!(3)));
        assert_eq!(t.trace_props[0].0, "x");
        assert_eq!(t.trace_props[1].0, "y");
    }

    #[test]
    fn nested_initiation_concatenates_trace_ids() {
        let outer = fresh(KeepTrace::Full);
        let inner = outer.nested("inner7", KeepTrace::Compact, true, false, meta());
        assert_eq!(inner.trace_id, "t1|inner7");
        assert!(inner.call_flow.is_empty());
        assert!(inner.non_persistent);
    }

    #[test]
    fn flags_survive_every_transition() {
        let mut t = MatsTrace::new("t", KeepTrace::Compact, true, true, meta());
        t = t.add_request_call(
            "i",
            Channel::queue("a"),
            json!(0),
            Channel::queue("term"),
            Value::Null,
            None,
            None,
        );
        t = t.add_next_call("a", Channel::queue("a.stage1"), json!(0), Value::Null, None);
        t = t.add_reply_call("a.stage1", json!(0), None).unwrap();
        assert!(t.non_persistent);
        assert!(t.interactive);
    }
}
