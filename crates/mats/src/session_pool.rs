//! Session and connection pooling.
//!
//! Sessions sharing one physical connection form a group. A member reporting
//! `crashed` taints the whole group: the physical connection is closed (it
//! is considered broken), which unblocks sibling receives; each sibling
//! observes the revocation and comes home via close-or-crash, and future
//! acquisitions get a fresh connection. Initiator sessions are checked out
//! per initiation and returned to an idle list for reuse; processor sessions
//! are held exclusively for the lifetime of a consumer loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use mats_broker::{BrokerResult, Connection, ConnectionFactory, Session};

/// Pools connections and carves per-use sessions out of them.
pub(crate) struct SessionPool {
    connection_factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// The group new acquisitions are served from.
    current: Option<Arc<ConnectionGroup>>,
    /// Every group not yet fully retired, for shutdown.
    groups: Vec<Weak<ConnectionGroup>>,
}

impl SessionPool {
    pub(crate) fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            connection_factory,
            state: Mutex::new(PoolState {
                current: None,
                groups: Vec::new(),
            }),
        }
    }

    /// Acquires a session. Initiators release it back afterwards; processors
    /// keep it for their consumer loop and close or crash it.
    pub(crate) fn acquire(&self) -> BrokerResult<PooledSession> {
        let group = self.current_group()?;

        let pooled = group.idle.lock().expect("pool idle lock poisoned").pop();
        let session = match pooled {
            Some(session) => session,
            None => match group.connection.create_session() {
                Ok(session) => session,
                Err(e) => {
                    // The connection died between connect and carve.
                    group.taint_and_close();
                    return Err(e);
                }
            },
        };
        group.live.fetch_add(1, Ordering::SeqCst);
        Ok(PooledSession {
            session: Some(session),
            group,
        })
    }

    /// Revokes every group. Blocked receives return and processors exit.
    pub(crate) fn close_all(&self) {
        let state = self.state.lock().expect("pool state lock poisoned");
        for weak in &state.groups {
            if let Some(group) = weak.upgrade() {
                group.taint_and_close();
            }
        }
    }

    fn current_group(&self) -> BrokerResult<Arc<ConnectionGroup>> {
        let mut state = self.state.lock().expect("pool state lock poisoned");
        if let Some(group) = &state.current {
            if !group.is_tainted() {
                return Ok(Arc::clone(group));
            }
        }
        debug!("establishing new broker connection");
        let connection = self.connection_factory.connect()?;
        let group = Arc::new(ConnectionGroup {
            connection,
            tainted: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
        });
        state.groups.retain(|w| w.upgrade().is_some());
        state.groups.push(Arc::downgrade(&group));
        state.current = Some(Arc::clone(&group));
        Ok(group)
    }
}

/// One physical connection and the sessions carved from it.
pub(crate) struct ConnectionGroup {
    connection: Box<dyn Connection>,
    tainted: AtomicBool,
    /// Sessions currently checked out.
    live: AtomicUsize,
    /// Returned initiator sessions available for reuse.
    idle: Mutex<Vec<Box<dyn Session>>>,
}

impl ConnectionGroup {
    fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    /// Marks the group broken and closes the physical connection, revoking
    /// every sibling session.
    fn taint_and_close(&self) {
        if !self.tainted.swap(true, Ordering::SeqCst) {
            warn!("broker connection tainted; revoking its sessions");
            self.close_idle();
            self.connection.close();
        }
    }

    /// A checked-out member came home.
    fn member_returned(&self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_tainted() {
            self.close_idle();
            self.connection.close();
        }
    }

    fn close_idle(&self) {
        for mut session in self
            .idle
            .lock()
            .expect("pool idle lock poisoned")
            .drain(..)
        {
            session.close();
        }
    }
}

/// A checked-out session, tied to its connection group.
pub(crate) struct PooledSession {
    session: Option<Box<dyn Session>>,
    group: Arc<ConnectionGroup>,
}

impl PooledSession {
    pub(crate) fn session_mut(&mut self) -> &mut dyn Session {
        self.session
            .as_mut()
            .expect("session present until returned")
            .as_mut()
    }

    /// Whether this session's group was tainted by a sibling crash.
    pub(crate) fn is_revoked(&self) -> bool {
        self.group.is_tainted()
    }

    /// Initiator-style return: back to the idle list for reuse, unless the
    /// group is tainted, in which case the session is closed.
    pub(crate) fn release(mut self) {
        let mut session = self.session.take().expect("session present until returned");
        if self.group.is_tainted() {
            session.close();
        } else {
            self.group
                .idle
                .lock()
                .expect("pool idle lock poisoned")
                .push(session);
        }
        self.group.member_returned();
    }

    /// Processor-style return: physically close the session.
    pub(crate) fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.group.member_returned();
    }

    /// The session (or its connection) failed: taint the whole group so
    /// siblings are revoked, and retire this session.
    pub(crate) fn crashed(mut self) {
        self.group.taint_and_close();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.group.member_returned();
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            self.group.member_returned();
        }
    }
}

/// Bounded exponential backoff with jitter, observed before reacquiring a
/// session after a crash.
pub(crate) struct Backoff {
    attempt: u32,
}

/// First delay after a crash.
const BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { attempt: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: base × 2^attempt, capped, with ±25% jitter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(1u32 << self.attempt.min(7));
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        exp.min(BACKOFF_CAP).mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mats_broker::{BrokerError, Consumer, Destination, OutgoingMessage};

    #[derive(Default)]
    struct StubStats {
        connects: AtomicUsize,
        sessions: AtomicUsize,
        connection_closes: AtomicUsize,
        session_closes: AtomicUsize,
    }

    struct StubFactory {
        stats: Arc<StubStats>,
    }

    impl ConnectionFactory for StubFactory {
        fn connect(&self) -> BrokerResult<Box<dyn Connection>> {
            self.stats.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubConnection {
                stats: Arc::clone(&self.stats),
            }))
        }
    }

    struct StubConnection {
        stats: Arc<StubStats>,
    }

    impl Connection for StubConnection {
        fn create_session(&self) -> BrokerResult<Box<dyn Session>> {
            self.stats.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                stats: Arc::clone(&self.stats),
                closed: false,
            }))
        }

        fn close(&self) {
            self.stats.connection_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubSession {
        stats: Arc<StubStats>,
        closed: bool,
    }

    impl Session for StubSession {
        fn send(&mut self, _d: &Destination, _m: OutgoingMessage) -> BrokerResult<()> {
            Ok(())
        }
        fn create_consumer(&mut self, _d: &Destination) -> BrokerResult<Box<dyn Consumer>> {
            Err(BrokerError::Consumer("stub".to_string()))
        }
        fn commit(&mut self) -> BrokerResult<()> {
            Ok(())
        }
        fn rollback(&mut self) -> BrokerResult<()> {
            Ok(())
        }
        fn is_still_active(&self) -> bool {
            !self.closed
        }
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.stats.session_closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn pool_with_stats() -> (SessionPool, Arc<StubStats>) {
        let stats = Arc::new(StubStats::default());
        let pool = SessionPool::new(Arc::new(StubFactory {
            stats: Arc::clone(&stats),
        }));
        (pool, stats)
    }

    #[test]
    fn released_sessions_are_reused() {
        let (pool, stats) = pool_with_stats();

        let s1 = pool.acquire().unwrap();
        s1.release();
        let s2 = pool.acquire().unwrap();
        s2.release();

        assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.sessions.load(Ordering::SeqCst), 1, "idle session reused");
    }

    #[test]
    fn sessions_share_one_connection() {
        let (pool, stats) = pool_with_stats();

        let s1 = pool.acquire().unwrap();
        let s2 = pool.acquire().unwrap();
        assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.sessions.load(Ordering::SeqCst), 2);
        s1.close();
        s2.close();
    }

    #[test]
    fn crash_revokes_siblings_and_replaces_the_connection() {
        let (pool, stats) = pool_with_stats();

        let s1 = pool.acquire().unwrap();
        let s2 = pool.acquire().unwrap();
        assert!(!s2.is_revoked());

        s1.crashed();
        assert!(s2.is_revoked(), "sibling must observe the taint");
        assert_eq!(stats.connection_closes.load(Ordering::SeqCst), 1);

        // Sibling comes home; a fresh acquisition gets a new connection.
        s2.close();
        let s3 = pool.acquire().unwrap();
        assert_eq!(stats.connects.load(Ordering::SeqCst), 2);
        assert!(!s3.is_revoked());
        s3.close();
    }

    #[test]
    fn release_onto_tainted_group_closes_the_session() {
        let (pool, stats) = pool_with_stats();

        let s1 = pool.acquire().unwrap();
        let s2 = pool.acquire().unwrap();
        s1.crashed();
        s2.release();

        assert_eq!(stats.session_closes.load(Ordering::SeqCst), 2);
        // Nothing left idle on the dead group.
        let s3 = pool.acquire().unwrap();
        assert_eq!(stats.sessions.load(Ordering::SeqCst), 3);
        s3.close();
    }

    #[test]
    fn close_all_revokes_current_group() {
        let (pool, stats) = pool_with_stats();
        let s1 = pool.acquire().unwrap();

        pool.close_all();
        assert!(s1.is_revoked());
        assert_eq!(stats.connection_closes.load(Ordering::SeqCst), 1);
        s1.close();
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for i in 0..12 {
            let delay = backoff.next_delay();
            // ±25% jitter around base × 2^min(i, 7), never above cap +25%.
            let nominal = BACKOFF_BASE * (1 << i.min(7));
            let nominal = nominal.min(BACKOFF_CAP);
            assert!(delay >= nominal.mul_f64(0.75), "delay {delay:?} below floor at attempt {i}");
            assert!(delay <= nominal.mul_f64(1.25), "delay {delay:?} above ceiling at attempt {i}");
            if i > 0 && i < 7 {
                assert!(delay > last.mul_f64(0.5), "should trend upward");
            }
            last = delay;
        }

        backoff.reset();
        assert!(backoff.next_delay() <= BACKOFF_BASE.mul_f64(1.25));
    }
}
