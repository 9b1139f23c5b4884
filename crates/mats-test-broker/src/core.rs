//! Shared broker state: queues, topic subscriptions, fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use mats_broker::{Destination, DestinationKind, IncomingMessage, OutgoingMessage};

/// One topic subscription with its private fan-out buffer.
pub(crate) struct Subscription {
    pub(crate) topic: String,
    pub(crate) buffer: VecDeque<IncomingMessage>,
}

/// Everything mutable, under one lock so one condvar covers all waiters.
pub(crate) struct CoreState {
    pub(crate) queues: HashMap<String, VecDeque<IncomingMessage>>,
    pub(crate) subs: HashMap<u64, Subscription>,
    pub(crate) next_sub_id: u64,
}

pub(crate) struct BrokerCore {
    state: Mutex<CoreState>,
    pub(crate) wakeup: Condvar,
    closed: AtomicBool,
    fail_commits: AtomicUsize,
    fail_connects: AtomicUsize,
}

impl BrokerCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoreState {
                queues: HashMap::new(),
                subs: HashMap::new(),
                next_sub_id: 0,
            }),
            wakeup: Condvar::new(),
            closed: AtomicBool::new(false),
            fail_commits: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("test broker state lock poisoned")
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    pub(crate) fn notify(&self) {
        self.wakeup.notify_all();
    }

    pub(crate) fn fail_next_commits(&self, n: usize) {
        self.fail_commits.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.fail_connects.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn take_commit_failure(&self) -> bool {
        take_one(&self.fail_commits)
    }

    pub(crate) fn take_connect_failure(&self) -> bool {
        take_one(&self.fail_connects)
    }

    pub(crate) fn queue_depth(&self, queue_name: &str) -> usize {
        self.lock().queues.get(queue_name).map_or(0, VecDeque::len)
    }

    pub(crate) fn drain_queue(&self, queue_name: &str) -> Vec<IncomingMessage> {
        self.lock()
            .queues
            .get_mut(queue_name)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub(crate) fn total_messages(&self) -> usize {
        let state = self.lock();
        let queued: usize = state.queues.values().map(VecDeque::len).sum();
        let buffered: usize = state.subs.values().map(|s| s.buffer.len()).sum();
        queued + buffered
    }

    /// Makes a committed send visible: queue append, or fan-out to every
    /// subscription that exists right now.
    pub(crate) fn publish(
        state: &mut CoreState,
        destination: &Destination,
        message: OutgoingMessage,
    ) {
        let incoming = IncomingMessage {
            destination: destination.clone(),
            headers: message.headers,
            bytes: message.bytes,
            strings: message.strings,
            persistent: message.persistent,
            priority: message.priority,
        };
        match destination.kind {
            DestinationKind::Queue => {
                state
                    .queues
                    .entry(destination.name.clone())
                    .or_default()
                    .push_back(incoming);
            }
            DestinationKind::Topic => {
                for sub in state.subs.values_mut() {
                    if sub.topic == destination.name {
                        sub.buffer.push_back(incoming.clone());
                    }
                }
            }
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}
