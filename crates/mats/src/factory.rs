//! The factory: endpoint registry, lifecycle, and shared runtime wiring.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mats_broker::{
    ConnectionFactory, Destination, MSG_ID_HEADER, OutgoingMessage, Priority, TRACE_ID_HEADER,
    WireKeys,
};
use mats_serial::{MatsSerializer, SerializationError};
use mats_trace::{InitiatorMeta, MatsTrace, Timestamp};

use crate::config::FactoryConfig;
use crate::endpoint::{Endpoint, EndpointSetup};
use crate::initiator::Initiator;
use crate::session_pool::SessionPool;
use crate::stage_processor::spawn_stage_processors;
use crate::transactions::TransactionManager;
use crate::ProcessContext;

/// How long past the graceful budget `stop` waits for threads to observe
/// their closed sessions before detaching them.
const STOP_JOIN_GRACE: Duration = Duration::from_millis(500);

/// The per-process entry point: holds the endpoint registry, the initiators,
/// the session pool and the configuration. Cheap to clone; clones share the
/// same factory.
///
/// # Lifecycle
///
/// Endpoints registered while the factory runs start immediately when
/// sealed, unless [`hold_endpoints_until_factory_start`] was called, in
/// which case they stay inert until [`start`]. [`stop`] drains cooperatively within a
/// budget, then closes sessions; [`start`] brings everything back.
///
/// [`hold_endpoints_until_factory_start`]: Self::hold_endpoints_until_factory_start
/// [`start`]: Self::start
/// [`stop`]: Self::stop
#[derive(Clone)]
pub struct MatsFactory {
    inner: Arc<FactoryInner>,
}

pub(crate) struct FactoryInner {
    pub(crate) config: FactoryConfig,
    pub(crate) wire_keys: WireKeys,
    pub(crate) serializer: Arc<dyn MatsSerializer>,
    pub(crate) pool: SessionPool,
    pub(crate) tx_manager: Option<Arc<dyn TransactionManager>>,

    endpoints: Mutex<BTreeMap<String, Arc<Endpoint>>>,
    initiators: Mutex<HashMap<String, Weak<Initiator>>>,

    running: AtomicBool,
    hold: AtomicBool,
    started_once: AtomicBool,
    /// Worker slots currently processing a message, for graceful drain.
    busy: AtomicUsize,

    start_progress: Mutex<StartProgress>,
    start_cond: Condvar,

    dropped_replies: AtomicU64,
    processed: AtomicU64,
    retries: AtomicU64,
}

#[derive(Default)]
struct StartProgress {
    expected: usize,
    started: usize,
}

impl MatsFactory {
    /// Creates a factory over a broker connection factory and serializer,
    /// with no external transactional resource.
    pub fn create(
        connection_factory: Arc<dyn ConnectionFactory>,
        serializer: Arc<dyn MatsSerializer>,
        config: FactoryConfig,
    ) -> Self {
        Self::build(connection_factory, serializer, None, config)
    }

    /// Creates a factory bridged to an external transactional resource;
    /// every stage execution and initiation brackets it per best-effort 1PC.
    pub fn create_with_resource(
        connection_factory: Arc<dyn ConnectionFactory>,
        serializer: Arc<dyn MatsSerializer>,
        tx_manager: Arc<dyn TransactionManager>,
        config: FactoryConfig,
    ) -> Self {
        Self::build(connection_factory, serializer, Some(tx_manager), config)
    }

    fn build(
        connection_factory: Arc<dyn ConnectionFactory>,
        serializer: Arc<dyn MatsSerializer>,
        tx_manager: Option<Arc<dyn TransactionManager>>,
        config: FactoryConfig,
    ) -> Self {
        info!(
            name = %config.name,
            app = %config.app_name,
            version = %config.app_version,
            "creating mats factory"
        );
        let wire_keys = WireKeys::new(&config.trace_key);
        Self {
            inner: Arc::new(FactoryInner {
                wire_keys,
                serializer,
                pool: SessionPool::new(connection_factory),
                tx_manager,
                config,
                endpoints: Mutex::new(BTreeMap::new()),
                initiators: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
                hold: AtomicBool::new(false),
                started_once: AtomicBool::new(false),
                busy: AtomicUsize::new(0),
                start_progress: Mutex::new(StartProgress::default()),
                start_cond: Condvar::new(),
                dropped_replies: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
        }
    }

    /// The factory's configuration.
    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    /// Creates an unsealed multi-stage endpoint with state `S`, replying `R`.
    ///
    /// # Panics
    ///
    /// Panics if `endpoint_id` is already registered.
    pub fn staged<S, R>(&self, endpoint_id: &str) -> EndpointSetup<S, R>
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        self.inner.assert_unregistered(endpoint_id);
        EndpointSetup::new(Arc::clone(&self.inner), endpoint_id, false)
    }

    /// Sugar: a one-stage endpoint that maps `I` to a reply `R`.
    pub fn single<I, R, F>(&self, endpoint_id: &str, f: F)
    where
        I: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.staged::<(), R>(endpoint_id)
            .last_stage::<I, _>(move |ctx, _state, incoming| f(ctx, incoming));
    }

    /// Sugar: a one-stage flow endpoint that consumes `I` with state `S` and
    /// never replies.
    pub fn terminator<S, I, F>(&self, endpoint_id: &str, f: F)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut setup = self.staged::<S, ()>(endpoint_id);
        setup.stage::<I, _>(f);
        setup.finish_setup();
    }

    /// Sugar: a terminator bound to a topic; concurrency is pinned to 1, and
    /// messages published while no subscription exists are lost by design.
    pub fn subscription_terminator<S, I, F>(&self, endpoint_id: &str, f: F)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.assert_unregistered(endpoint_id);
        let mut setup: EndpointSetup<S, ()> =
            EndpointSetup::new(Arc::clone(&self.inner), endpoint_id, true);
        setup.stage::<I, _>(f);
        setup.finish_setup();
    }

    /// Keeps sealed endpoints inert until [`start`](Self::start), so the
    /// registry can be populated before surrounding components are ready.
    pub fn hold_endpoints_until_factory_start(&self) {
        self.inner.hold.store(true, Ordering::SeqCst);
    }

    /// Starts all registered endpoints' processors (held or stopped ones
    /// included).
    pub fn start(&self) {
        info!(name = %self.inner.config.name, "starting mats factory");
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.started_once.store(true, Ordering::SeqCst);
        let endpoints: Vec<Arc<Endpoint>> = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for endpoint in endpoints {
            FactoryInner::start_endpoint(&self.inner, &endpoint);
        }
    }

    /// Blocks until every spawned processor has acquired a session and
    /// entered its receive loop, or the timeout passes.
    pub fn wait_for_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self
            .inner
            .start_progress
            .lock()
            .expect("start progress lock poisoned");
        loop {
            if progress.started >= progress.expected {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            progress = self
                .inner
                .start_cond
                .wait_timeout(progress, deadline - now)
                .expect("start progress lock poisoned")
                .0;
        }
    }

    /// Stops all processors: requests drain, waits up to `graceful` for
    /// in-flight work, then closes sessions and joins the workers. Returns
    /// `true` when the shutdown was clean (no work abandoned mid-flight).
    pub fn stop(&self, graceful: Duration) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return true;
        }
        info!(name = %self.inner.config.name, "stopping mats factory");
        let deadline = Instant::now() + graceful;

        // Drain: let in-flight stage executions finish inside the budget.
        while self.inner.busy.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut clean = self.inner.busy.load(Ordering::SeqCst) == 0;
        if !clean {
            warn!("graceful budget exhausted with stage executions in flight");
        }

        // Force: revoke sessions so blocked receives return.
        self.inner.pool.close_all();

        let endpoints: Vec<Arc<Endpoint>> = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .values()
            .cloned()
            .collect();
        let join_deadline = deadline + STOP_JOIN_GRACE;
        for endpoint in &endpoints {
            let handles: Vec<_> = endpoint
                .handles
                .lock()
                .expect("endpoint handles lock poisoned")
                .drain(..)
                .collect();
            for handle in handles {
                while !handle.is_finished() && Instant::now() < join_deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    // An in-flight lambda is still running; it completes or
                    // rolls back naturally after we return.
                    clean = false;
                }
            }
            endpoint.started.store(false, Ordering::SeqCst);
        }

        let mut progress = self
            .inner
            .start_progress
            .lock()
            .expect("start progress lock poisoned");
        *progress = StartProgress::default();
        drop(progress);

        debug!(clean, "mats factory stopped");
        clean
    }

    /// The default initiator.
    pub fn default_initiator(&self) -> Arc<Initiator> {
        self.initiator("default")
    }

    /// Gets or creates the named initiator.
    pub fn initiator(&self, name: &str) -> Arc<Initiator> {
        let mut initiators = self
            .inner
            .initiators
            .lock()
            .expect("initiator registry lock poisoned");
        if let Some(existing) = initiators.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        let initiator = Arc::new(Initiator::new(name, Arc::clone(&self.inner)));
        initiators.insert(name.to_string(), Arc::downgrade(&initiator));
        initiator
    }

    /// Registered endpoint ids, sorted.
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Replies that found an empty stack and were dropped.
    pub fn dropped_replies(&self) -> u64 {
        self.inner.dropped_replies.load(Ordering::SeqCst)
    }

    /// Messages processed and committed across all stages.
    pub fn processed_messages(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    /// Stage executions that rolled back for redelivery.
    pub fn stage_retries(&self) -> u64 {
        self.inner.retries.load(Ordering::SeqCst)
    }
}

impl FactoryInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Call-site description carried in every call's debug info.
    pub(crate) fn debug_info(&self) -> String {
        format!(
            "{};{};{}",
            self.config.app_name, self.config.app_version, self.config.nodename
        )
    }

    pub(crate) fn initiator_meta(&self, initiator_id: &str) -> InitiatorMeta {
        InitiatorMeta {
            app_name: self.config.app_name.clone(),
            app_version: self.config.app_version.clone(),
            host: self.config.nodename.clone(),
            initiator_id: initiator_id.to_string(),
            init_timestamp: Timestamp::now(),
        }
    }

    /// Serializes an outbound envelope into a broker message addressed at
    /// its current call, with flags, headers and side channels applied.
    pub(crate) fn build_message(
        &self,
        trace: &MatsTrace,
        extra_bytes: &[(String, Vec<u8>)],
        extra_strings: &[(String, String)],
    ) -> Result<(Destination, OutgoingMessage), SerializationError> {
        let call = trace
            .current_call()
            .expect("outbound envelope has a current call");
        let destination = Destination::for_channel(&self.config.destination_prefix, &call.to);

        let serialized = self.serializer.serialize_trace(trace)?;
        let mut message = OutgoingMessage::new();
        message.persistent = !trace.non_persistent;
        message.priority = if trace.interactive {
            Priority::High
        } else {
            Priority::Normal
        };
        message
            .headers
            .insert(TRACE_ID_HEADER.to_string(), trace.trace_id.clone());
        message
            .headers
            .insert(MSG_ID_HEADER.to_string(), Uuid::new_v4().to_string());
        message
            .bytes
            .insert(self.wire_keys.trace().to_string(), serialized.bytes);
        message
            .strings
            .insert(self.wire_keys.meta().to_string(), serialized.meta);
        for (key, value) in extra_bytes {
            message
                .bytes
                .insert(self.wire_keys.side_bytes(key), value.clone());
        }
        for (key, value) in extra_strings {
            message
                .strings
                .insert(self.wire_keys.side_string(key), value.clone());
        }
        Ok((destination, message))
    }

    pub(crate) fn assert_unregistered(&self, endpoint_id: &str) {
        assert!(
            !self
                .endpoints
                .lock()
                .expect("endpoint registry lock poisoned")
                .contains_key(endpoint_id),
            "endpoint '{endpoint_id}' already registered"
        );
    }

    /// Registers a sealed endpoint and starts it unless the factory holds.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint id is already registered.
    pub(crate) fn register_endpoint(inner: &Arc<Self>, endpoint: Arc<Endpoint>) {
        {
            let mut endpoints = inner
                .endpoints
                .lock()
                .expect("endpoint registry lock poisoned");
            assert!(
                !endpoints.contains_key(&endpoint.id),
                "endpoint '{}' already registered",
                endpoint.id
            );
            debug!(
                endpoint = %endpoint.id,
                stages = endpoint.stages.len(),
                subscription = endpoint.subscription,
                "endpoint registered"
            );
            endpoints.insert(endpoint.id.clone(), Arc::clone(&endpoint));
        }

        let held = inner.hold.load(Ordering::SeqCst) && !inner.started_once.load(Ordering::SeqCst);
        if inner.is_running() && !held {
            Self::start_endpoint(inner, &endpoint);
        }
    }

    pub(crate) fn start_endpoint(inner: &Arc<Self>, endpoint: &Arc<Endpoint>) {
        if endpoint.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(endpoint = %endpoint.id, "starting endpoint processors");
        for stage in &endpoint.stages {
            spawn_stage_processors(inner, endpoint, stage);
        }
    }

    pub(crate) fn add_expected_processors(&self, count: usize) {
        let mut progress = self
            .start_progress
            .lock()
            .expect("start progress lock poisoned");
        progress.expected += count;
    }

    pub(crate) fn mark_processor_started(&self) {
        let mut progress = self
            .start_progress
            .lock()
            .expect("start progress lock poisoned");
        progress.started += 1;
        drop(progress);
        self.start_cond.notify_all();
    }

    pub(crate) fn enter_processing(&self) -> BusyGuard<'_> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard { inner: self }
    }

    pub(crate) fn note_processed(&self, dropped_replies: u64) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if dropped_replies > 0 {
            self.dropped_replies
                .fetch_add(dropped_replies, Ordering::SeqCst);
        }
    }

    pub(crate) fn note_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

/// Marks a worker slot busy for the duration of one message's processing.
pub(crate) struct BusyGuard<'a> {
    inner: &'a FactoryInner,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.busy.fetch_sub(1, Ordering::SeqCst);
    }
}
