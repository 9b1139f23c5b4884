//! Stage processors: one consumer loop per concurrency slot.
//!
//! Each slot is a named OS thread running receive → deserialize → invoke
//! lambda → materialize emissions → commit, inside the coordinator's
//! transactional bracket. Session crashes taint the connection group and the
//! slot reacquires after a jittered backoff; a cooperative run flag governs
//! shutdown, with blocked receives unstuck by closing sessions.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::Value;
use tracing::{debug, error, info_span, warn};

use mats_broker::{Destination, IncomingMessage, Session};
use mats_trace::{Channel, MatsTrace};

use crate::endpoint::{Endpoint, Stage};
use crate::error::StageFailure;
use crate::factory::FactoryInner;
use crate::process_context::{OutboundIntent, ProcessContext};
use crate::session_pool::Backoff;
use crate::transactions::{TxAttemptError, within_transaction};

/// Spawns the worker threads for one stage. Subscription stages are pinned
/// to one slot; others resolve stage, then endpoint, then factory
/// concurrency.
pub(crate) fn spawn_stage_processors(
    inner: &Arc<FactoryInner>,
    endpoint: &Arc<Endpoint>,
    stage: &Arc<Stage>,
) {
    let concurrency = if stage.subscription {
        1
    } else {
        stage
            .concurrency
            .or(endpoint.concurrency)
            .unwrap_or(inner.config.concurrency)
            .max(1)
    };
    inner.add_expected_processors(concurrency);

    let mut handles = endpoint
        .handles
        .lock()
        .expect("endpoint handles lock poisoned");
    for slot in 0..concurrency {
        let inner = Arc::clone(inner);
        let stage = Arc::clone(stage);
        let handle = thread::Builder::new()
            .name(format!("mats-{}-{slot}", stage.id))
            .spawn(move || processor_loop(&inner, &stage, slot))
            .expect("failed to spawn stage processor thread");
        handles.push(handle);
    }
}

fn processor_loop(inner: &Arc<FactoryInner>, stage: &Arc<Stage>, slot: usize) {
    let destination = Destination::for_channel(&inner.config.destination_prefix, &stage.channel());
    let mut backoff = Backoff::new();
    let mut announced = false;
    debug!(
        stage = %stage.id,
        index = stage.index,
        slot,
        destination = %destination,
        "stage processor starting"
    );

    'acquire: while inner.is_running() {
        let mut pooled = match inner.pool.acquire() {
            Ok(pooled) => pooled,
            Err(e) => {
                warn!(stage = %stage.id, error = %e, "session acquisition failed; backing off");
                sleep_while_running(inner, backoff.next_delay());
                continue 'acquire;
            }
        };
        let mut consumer = match pooled.session_mut().create_consumer(&destination) {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(stage = %stage.id, error = %e, "consumer creation failed; backing off");
                pooled.crashed();
                sleep_while_running(inner, backoff.next_delay());
                continue 'acquire;
            }
        };
        if !announced {
            inner.mark_processor_started();
            announced = true;
        }

        loop {
            if !inner.is_running() {
                pooled.close();
                break 'acquire;
            }
            if pooled.is_revoked() {
                pooled.close();
                continue 'acquire;
            }
            match consumer.receive() {
                Ok(Some(message)) => {
                    match handle_message(inner, stage, pooled.session_mut(), message) {
                        Ok(()) => backoff.reset(),
                        Err(TxAttemptError::Retry(e)) => {
                            inner.note_retry();
                            warn!(
                                stage = %stage.id,
                                error = %e,
                                "stage processing failed; rolled back for redelivery"
                            );
                        }
                        Err(TxAttemptError::SessionLost(e)) => {
                            warn!(stage = %stage.id, error = %e, "session lost mid-processing");
                            pooled.crashed();
                            sleep_while_running(inner, backoff.next_delay());
                            continue 'acquire;
                        }
                        Err(TxAttemptError::MessageSend(e)) => {
                            error!(
                                stage = %stage.id,
                                error = %e,
                                "broker commit failed after external resource commit"
                            );
                            pooled.crashed();
                            sleep_while_running(inner, backoff.next_delay());
                            continue 'acquire;
                        }
                    }
                }
                Ok(None) => {
                    if !inner.is_running() {
                        pooled.close();
                        break 'acquire;
                    }
                    // Session closed under us: a sibling crash or broker loss.
                    pooled.close();
                    sleep_while_running(inner, backoff.next_delay());
                    continue 'acquire;
                }
                Err(e) => {
                    warn!(stage = %stage.id, error = %e, "receive failed; session crashed");
                    pooled.crashed();
                    sleep_while_running(inner, backoff.next_delay());
                    continue 'acquire;
                }
            }
        }
    }
    debug!(stage = %stage.id, slot, "stage processor stopped");
}

/// Processes one received message inside the transactional bracket.
///
/// Unparsable messages (no envelope, undecodable envelope) roll back and
/// ride redelivery until the broker's poison policy takes them; everything
/// else flows through the user lambda and the outbound materialization.
fn handle_message(
    inner: &FactoryInner,
    stage: &Stage,
    session: &mut dyn Session,
    message: IncomingMessage,
) -> Result<(), TxAttemptError> {
    let _busy = inner.enter_processing();

    let Some(envelope) = message.bytes.get(inner.wire_keys.trace()) else {
        warn!(stage = %stage.id, "message carries no envelope; rolling back");
        rollback_quietly(session);
        return Ok(());
    };
    let Some(meta) = message.strings.get(inner.wire_keys.meta()) else {
        warn!(stage = %stage.id, "message carries no serializer meta; rolling back");
        rollback_quietly(session);
        return Ok(());
    };
    let trace = match inner.serializer.deserialize_trace(envelope, meta) {
        Ok(trace) => trace,
        Err(e) => {
            warn!(stage = %stage.id, error = %e, "envelope deserialization failed; rolling back");
            rollback_quietly(session);
            return Ok(());
        }
    };

    let span = info_span!("stage", stage_id = %stage.id, trace_id = %trace.trace_id);
    let _span = span.enter();

    let incoming = trace
        .current_call()
        .and_then(|call| call.data.clone())
        .unwrap_or(Value::Null);
    let state = trace.current_state().cloned();

    let mut dropped_replies = 0u64;
    let result = within_transaction(session, inner.tx_manager.as_deref(), || {
        let mut ctx = ProcessContext::new(inner, stage, &trace, &message);
        let final_state = invoke_lambda(stage, &mut ctx, incoming, state.as_ref())?;
        materialize(inner, stage, &trace, ctx, &final_state, &mut dropped_replies)
    });

    if result.is_ok() {
        inner.note_processed(dropped_replies);
    }
    result
}

/// Runs the user lambda, translating panics into ordinary failures so the
/// transaction rolls back and the slot survives.
fn invoke_lambda(
    stage: &Stage,
    ctx: &mut ProcessContext<'_>,
    incoming: Value,
    state: Option<&Value>,
) -> anyhow::Result<Value> {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (stage.lambda)(ctx, incoming, state)
    }));
    match outcome {
        Ok(Ok(final_state)) => Ok(final_state),
        Ok(Err(StageFailure::Serialization(e))) => Err(anyhow::Error::new(e)),
        Ok(Err(StageFailure::User(e))) => Err(e),
        Err(panic) => Err(anyhow!("stage lambda panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Turns collected intents into wire messages, cloning the inbound envelope
/// per emission so the source is never mutated.
fn materialize(
    inner: &FactoryInner,
    stage: &Stage,
    trace: &MatsTrace,
    ctx: ProcessContext<'_>,
    final_state: &Value,
    dropped_replies: &mut u64,
) -> anyhow::Result<Vec<(Destination, mats_broker::OutgoingMessage)>> {
    let ProcessContext {
        intents,
        prop_updates,
        out_bytes,
        out_strings,
        ..
    } = ctx;

    let mut base = trace.clone();
    for (name, value) in prop_updates {
        base.set_trace_property(name, value);
    }
    let debug_info = Some(inner.debug_info());

    let mut outbound = Vec::with_capacity(intents.len());
    for intent in intents {
        match intent {
            OutboundIntent::Reply { data } => {
                match base.add_reply_call(&stage.id, data, debug_info.clone()) {
                    Some(next) => {
                        outbound.push(inner.build_message(&next, &out_bytes, &out_strings)?);
                    }
                    None => {
                        *dropped_replies += 1;
                        debug!(stage = %stage.id, "reply with empty stack dropped");
                    }
                }
            }
            OutboundIntent::Request {
                to,
                data,
                initial_state,
            } => {
                let continuation = stage.next_stage_id.clone().ok_or_else(|| {
                    anyhow!("request from terminal stage '{}' has no continuation", stage.id)
                })?;
                let next = base.add_request_call(
                    &stage.id,
                    Channel::queue(to),
                    data,
                    Channel::queue(continuation),
                    final_state.clone(),
                    initial_state,
                    debug_info.clone(),
                );
                outbound.push(inner.build_message(&next, &out_bytes, &out_strings)?);
            }
            OutboundIntent::Next { data } => {
                let continuation = stage.next_stage_id.clone().ok_or_else(|| {
                    anyhow!("next from terminal stage '{}' has no continuation", stage.id)
                })?;
                let next = base.add_next_call(
                    &stage.id,
                    Channel::queue(continuation),
                    data,
                    final_state.clone(),
                    debug_info.clone(),
                );
                outbound.push(inner.build_message(&next, &out_bytes, &out_strings)?);
            }
            OutboundIntent::Publish {
                to,
                data,
                initial_state,
            } => {
                let next = base.add_send_call(
                    &stage.id,
                    Channel::topic(to),
                    data,
                    initial_state,
                    debug_info.clone(),
                );
                outbound.push(inner.build_message(&next, &out_bytes, &out_strings)?);
            }
            OutboundIntent::Initiate { messages } => outbound.extend(messages),
        }
    }
    Ok(outbound)
}

fn rollback_quietly(session: &mut dyn Session) {
    if let Err(e) = session.rollback() {
        warn!(error = %e, "rollback of unparsable message failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Sleeps in small slices so shutdown is not delayed by a long backoff.
fn sleep_while_running(inner: &FactoryInner, total: Duration) {
    let deadline = Instant::now() + total;
    while inner.is_running() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(25)));
    }
}
