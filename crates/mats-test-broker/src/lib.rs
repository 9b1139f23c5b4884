//! # mats-test-broker: In-memory transactional broker
//!
//! A broker standing behind the `mats-broker` port, living entirely in
//! process memory. It exists so the runtime's behavior can be exercised
//! deterministically in tests: transactional send/receive on FIFO queues,
//! publish/subscribe on topics (subscriptions see only messages published
//! while they exist), rollback redelivery, and fault injection for commit
//! and connect.
//!
//! Delivery notes:
//! - Sends are staged per session and become visible only on commit.
//! - Received messages are un-acknowledged until commit; rollback or a close
//!   without commit pushes them back to the front of their queue.
//! - The per-message priority flag is carried but does not reorder delivery;
//!   deterministic FIFO is worth more to tests than priority realism.

use std::sync::Arc;

mod core;
mod session;

use crate::core::BrokerCore;
pub use session::TestConnectionFactory;

/// An in-memory broker shared by any number of connections.
///
/// Cheap to clone via [`connection_factory`](Self::connection_factory);
/// all factories and connections observe the same queues and topics.
pub struct TestBroker {
    core: Arc<BrokerCore>,
}

impl TestBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore::new()),
        }
    }

    /// Returns a connection factory for this broker, to hand to the runtime.
    pub fn connection_factory(&self) -> TestConnectionFactory {
        TestConnectionFactory::new(Arc::clone(&self.core))
    }

    /// Makes the next `n` session commits fail after discarding their staged
    /// sends and redelivering their receives, like a broker that dies
    /// between the external-resource commit and its own.
    pub fn fail_next_commits(&self, n: usize) {
        self.core.fail_next_commits(n);
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.core.fail_next_connects(n);
    }

    /// Number of committed messages sitting in the named queue.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.core.queue_depth(queue_name)
    }

    /// Removes and returns every committed message in the named queue, for
    /// inspecting wire-level flags and headers in tests.
    pub fn drain_queue(&self, queue_name: &str) -> Vec<mats_broker::IncomingMessage> {
        self.core.drain_queue(queue_name)
    }

    /// Total committed messages across all queues and subscription buffers.
    pub fn total_messages(&self) -> usize {
        self.core.total_messages()
    }

    /// Shuts the broker down: all blocked receives return `Ok(None)` and
    /// further connects fail.
    pub fn close(&self) {
        self.core.close();
    }
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mats_broker::{
        BrokerError, ConnectionFactory, Destination, OutgoingMessage, TRACE_ID_HEADER,
    };
    use std::thread;
    use std::time::Duration;

    fn msg(tag: &str) -> OutgoingMessage {
        let mut m = OutgoingMessage::new();
        m.headers.insert(TRACE_ID_HEADER.to_string(), tag.to_string());
        m.bytes.insert("body".to_string(), tag.as_bytes().to_vec());
        m
    }

    fn tag(m: &mats_broker::IncomingMessage) -> String {
        m.headers.get(TRACE_ID_HEADER).cloned().unwrap_or_default()
    }

    #[test]
    fn staged_sends_are_invisible_until_commit() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut session = conn.create_session().unwrap();

        let dest = Destination::queue("mats.q");
        session.send(&dest, msg("a")).unwrap();
        assert_eq!(broker.queue_depth("mats.q"), 0);

        session.commit().unwrap();
        assert_eq!(broker.queue_depth("mats.q"), 1);
    }

    #[test]
    fn queue_is_fifo_within_one_consumer() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut producer = conn.create_session().unwrap();
        let dest = Destination::queue("mats.q");
        for t in ["1", "2", "3"] {
            producer.send(&dest, msg(t)).unwrap();
        }
        producer.commit().unwrap();

        let mut consumer_session = conn.create_session().unwrap();
        let mut consumer = consumer_session.create_consumer(&dest).unwrap();
        for t in ["1", "2", "3"] {
            let got = consumer.receive().unwrap().unwrap();
            assert_eq!(tag(&got), t);
        }
        consumer_session.commit().unwrap();
        assert_eq!(broker.queue_depth("mats.q"), 0);
    }

    #[test]
    fn rollback_redelivers_in_order() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut producer = conn.create_session().unwrap();
        let dest = Destination::queue("mats.q");
        for t in ["1", "2"] {
            producer.send(&dest, msg(t)).unwrap();
        }
        producer.commit().unwrap();

        let mut session = conn.create_session().unwrap();
        let mut consumer = session.create_consumer(&dest).unwrap();
        assert_eq!(tag(&consumer.receive().unwrap().unwrap()), "1");
        session.rollback().unwrap();

        // Redelivered to the front: same order again.
        assert_eq!(tag(&consumer.receive().unwrap().unwrap()), "1");
        assert_eq!(tag(&consumer.receive().unwrap().unwrap()), "2");
    }

    #[test]
    fn blocked_receive_wakes_on_commit() {
        let broker = TestBroker::new();
        let factory = broker.connection_factory();

        let consumer_thread = thread::spawn({
            let factory = factory.clone();
            move || {
                let conn = factory.connect().unwrap();
                let mut session = conn.create_session().unwrap();
                let mut consumer = session
                    .create_consumer(&Destination::queue("mats.q"))
                    .unwrap();
                let got = consumer.receive().unwrap().unwrap();
                session.commit().unwrap();
                tag(&got)
            }
        });

        thread::sleep(Duration::from_millis(50));
        let conn = factory.connect().unwrap();
        let mut producer = conn.create_session().unwrap();
        producer.send(&Destination::queue("mats.q"), msg("hello")).unwrap();
        producer.commit().unwrap();

        assert_eq!(consumer_thread.join().unwrap(), "hello");
    }

    #[test]
    fn topics_fan_out_to_live_subscriptions_only() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let dest = Destination::topic("mats.evt");

        let mut sub_a = conn.create_session().unwrap();
        let mut consumer_a = sub_a.create_consumer(&dest).unwrap();
        let mut sub_b = conn.create_session().unwrap();
        let mut consumer_b = sub_b.create_consumer(&dest).unwrap();

        let mut producer = conn.create_session().unwrap();
        producer.send(&dest, msg("e1")).unwrap();
        producer.commit().unwrap();

        assert_eq!(tag(&consumer_a.receive().unwrap().unwrap()), "e1");
        assert_eq!(tag(&consumer_b.receive().unwrap().unwrap()), "e1");

        // A subscription created after the publish sees nothing.
        let mut late = conn.create_session().unwrap();
        let mut late_consumer = late.create_consumer(&dest).unwrap();
        late.close();
        assert!(late_consumer.receive().unwrap().is_none());
    }

    #[test]
    fn injected_commit_failure_discards_staged_sends() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut session = conn.create_session().unwrap();

        broker.fail_next_commits(1);
        session.send(&Destination::queue("mats.q"), msg("lost")).unwrap();
        let err = session.commit().unwrap_err();
        assert!(matches!(err, BrokerError::CommitFailed(_)));
        assert_eq!(broker.queue_depth("mats.q"), 0);

        // The session recovers for the next transaction.
        session.send(&Destination::queue("mats.q"), msg("kept")).unwrap();
        session.commit().unwrap();
        assert_eq!(broker.queue_depth("mats.q"), 1);
    }

    #[test]
    fn injected_connect_failure_then_recovery() {
        let broker = TestBroker::new();
        let factory = broker.connection_factory();
        broker.fail_next_connects(1);
        assert!(factory.connect().is_err());
        assert!(factory.connect().is_ok());
    }

    #[test]
    fn session_close_unblocks_receive() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut session = conn.create_session().unwrap();
        let mut consumer = session
            .create_consumer(&Destination::queue("mats.q"))
            .unwrap();

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            session.close();
            session
        });
        assert!(consumer.receive().unwrap().is_none());
        drop(closer.join().unwrap());
    }

    #[test]
    fn connection_close_unblocks_sessions() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let mut session = conn.create_session().unwrap();
        let mut consumer = session
            .create_consumer(&Destination::queue("mats.q"))
            .unwrap();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            conn.close();
        });
        assert!(consumer.receive().unwrap().is_none());
    }

    #[test]
    fn close_without_commit_redelivers_receives() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let dest = Destination::queue("mats.q");
        let mut producer = conn.create_session().unwrap();
        producer.send(&dest, msg("m")).unwrap();
        producer.commit().unwrap();

        let mut session = conn.create_session().unwrap();
        let mut consumer = session.create_consumer(&dest).unwrap();
        assert_eq!(tag(&consumer.receive().unwrap().unwrap()), "m");
        session.close();

        assert_eq!(broker.queue_depth("mats.q"), 1);
    }

    #[test]
    fn persistence_and_priority_flags_are_carried() {
        let broker = TestBroker::new();
        let conn = broker.connection_factory().connect().unwrap();
        let dest = Destination::queue("mats.q");

        let mut producer = conn.create_session().unwrap();
        let mut outgoing = msg("m");
        outgoing.persistent = false;
        outgoing.priority = mats_broker::Priority::High;
        producer.send(&dest, outgoing).unwrap();
        producer.commit().unwrap();

        let mut session = conn.create_session().unwrap();
        let mut consumer = session.create_consumer(&dest).unwrap();
        let got = consumer.receive().unwrap().unwrap();
        assert!(!got.persistent);
        assert_eq!(got.priority, mats_broker::Priority::High);
        session.commit().unwrap();
    }
}
