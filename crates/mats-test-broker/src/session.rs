//! Connections, sessions and consumers over the shared broker core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mats_broker::{
    BrokerError, BrokerResult, Connection, ConnectionFactory, Consumer, Destination,
    DestinationKind, IncomingMessage, OutgoingMessage, Session,
};

use crate::core::{BrokerCore, Subscription};

/// How long a blocked receive sleeps between wakeup checks. The condvar is
/// notified on every commit and close; the timeout is a safety net.
const RECEIVE_POLL: Duration = Duration::from_millis(25);

/// A received-but-uncommitted message, remembered for redelivery.
enum PendingAck {
    Queue(String, IncomingMessage),
    Sub(u64, IncomingMessage),
}

/// Connection factory handed to the runtime. Clones share the broker.
#[derive(Clone)]
pub struct TestConnectionFactory {
    core: Arc<BrokerCore>,
}

impl TestConnectionFactory {
    pub(crate) fn new(core: Arc<BrokerCore>) -> Self {
        Self { core }
    }
}

impl ConnectionFactory for TestConnectionFactory {
    fn connect(&self) -> BrokerResult<Box<dyn Connection>> {
        if self.core.is_closed() {
            return Err(BrokerError::ConnectionFailed("broker closed".to_string()));
        }
        if self.core.take_connect_failure() {
            return Err(BrokerError::ConnectionFailed(
                "injected connect failure".to_string(),
            ));
        }
        Ok(Box::new(TestConnection {
            core: Arc::clone(&self.core),
            open: AtomicBool::new(true),
            session_flags: Mutex::new(Vec::new()),
        }))
    }
}

struct TestConnection {
    core: Arc<BrokerCore>,
    open: AtomicBool,
    /// Open-flags of sessions carved from this connection, so closing the
    /// connection unblocks their receives.
    session_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Connection for TestConnection {
    fn create_session(&self) -> BrokerResult<Box<dyn Session>> {
        if !self.open.load(Ordering::SeqCst) || self.core.is_closed() {
            return Err(BrokerError::SessionLost("connection closed".to_string()));
        }
        let flag = Arc::new(AtomicBool::new(true));
        self.session_flags
            .lock()
            .expect("session flag lock poisoned")
            .push(Arc::clone(&flag));
        Ok(Box::new(TestSession {
            core: Arc::clone(&self.core),
            open: flag,
            staged: Vec::new(),
            pending: Arc::new(Mutex::new(Vec::new())),
            sub_ids: Vec::new(),
        }))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            for flag in self
                .session_flags
                .lock()
                .expect("session flag lock poisoned")
                .iter()
            {
                flag.store(false, Ordering::SeqCst);
            }
            self.core.notify();
        }
    }
}

struct TestSession {
    core: Arc<BrokerCore>,
    open: Arc<AtomicBool>,
    staged: Vec<(Destination, OutgoingMessage)>,
    pending: Arc<Mutex<Vec<PendingAck>>>,
    sub_ids: Vec<u64>,
}

impl TestSession {
    fn redeliver_pending(&mut self) {
        let mut pending: Vec<PendingAck> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain(..)
            .collect();
        if pending.is_empty() {
            return;
        }
        let mut state = self.core.lock();
        // Push to the front in reverse so the original order is restored.
        for ack in pending.drain(..).rev() {
            match ack {
                PendingAck::Queue(name, message) => {
                    state.queues.entry(name).or_default().push_front(message);
                }
                PendingAck::Sub(id, message) => {
                    if let Some(sub) = state.subs.get_mut(&id) {
                        sub.buffer.push_front(message);
                    }
                }
            }
        }
        drop(state);
        self.core.notify();
    }
}

impl Session for TestSession {
    fn send(&mut self, destination: &Destination, message: OutgoingMessage) -> BrokerResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed);
        }
        self.staged.push((destination.clone(), message));
        Ok(())
    }

    fn create_consumer(&mut self, destination: &Destination) -> BrokerResult<Box<dyn Consumer>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed);
        }
        let sub_id = match destination.kind {
            DestinationKind::Queue => None,
            DestinationKind::Topic => {
                let mut state = self.core.lock();
                let id = state.next_sub_id;
                state.next_sub_id += 1;
                state.subs.insert(
                    id,
                    Subscription {
                        topic: destination.name.clone(),
                        buffer: std::collections::VecDeque::new(),
                    },
                );
                self.sub_ids.push(id);
                Some(id)
            }
        };
        Ok(Box::new(TestConsumer {
            core: Arc::clone(&self.core),
            destination: destination.clone(),
            sub_id,
            session_open: Arc::clone(&self.open),
            pending: Arc::clone(&self.pending),
        }))
    }

    fn commit(&mut self) -> BrokerResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed);
        }
        if self.core.take_commit_failure() {
            // A failed commit rolls the transaction back as a unit.
            self.staged.clear();
            self.redeliver_pending();
            return Err(BrokerError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .clear();
        let staged = std::mem::take(&mut self.staged);
        let mut state = self.core.lock();
        for (destination, message) in staged {
            BrokerCore::publish(&mut state, &destination, message);
        }
        drop(state);
        self.core.notify();
        Ok(())
    }

    fn rollback(&mut self) -> BrokerResult<()> {
        self.staged.clear();
        self.redeliver_pending();
        Ok(())
    }

    fn is_still_active(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.core.is_closed()
    }

    fn close(&mut self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.staged.clear();
        self.redeliver_pending();
        let mut state = self.core.lock();
        for id in self.sub_ids.drain(..) {
            state.subs.remove(&id);
        }
        drop(state);
        self.core.notify();
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct TestConsumer {
    core: Arc<BrokerCore>,
    destination: Destination,
    sub_id: Option<u64>,
    session_open: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<PendingAck>>>,
}

impl Consumer for TestConsumer {
    fn receive(&mut self) -> BrokerResult<Option<IncomingMessage>> {
        let mut state = self.core.lock();
        loop {
            if !self.session_open.load(Ordering::SeqCst) || self.core.is_closed() {
                return Ok(None);
            }
            let popped = match self.destination.kind {
                DestinationKind::Queue => state
                    .queues
                    .get_mut(&self.destination.name)
                    .and_then(std::collections::VecDeque::pop_front)
                    .map(|m| (PendingAck::Queue(self.destination.name.clone(), m.clone()), m)),
                DestinationKind::Topic => {
                    let id = self
                        .sub_id
                        .ok_or_else(|| BrokerError::Consumer("topic consumer without subscription".to_string()))?;
                    state
                        .subs
                        .get_mut(&id)
                        .and_then(|s| s.buffer.pop_front())
                        .map(|m| (PendingAck::Sub(id, m.clone()), m))
                }
            };
            if let Some((ack, message)) = popped {
                drop(state);
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .push(ack);
                return Ok(Some(message));
            }
            state = self
                .core
                .wakeup
                .wait_timeout(state, RECEIVE_POLL)
                .expect("test broker state lock poisoned")
                .0;
        }
    }
}
