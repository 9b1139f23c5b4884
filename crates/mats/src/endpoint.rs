//! Endpoints and stages.
//!
//! An endpoint is an ordered chain of stages; each stage is an independent
//! message consumer. The typed surface ([`EndpointSetup`]) erases user
//! lambdas into a uniform shape over the opaque payload model, so the stage
//! processor is oblivious to user types. Stage 0 receives on the endpoint id
//! itself; stage `i > 0` on `"<endpointId>.stage<i>"`, which doubles as the
//! continuation channel pushed by that stage's requests.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use mats_trace::Channel;

use crate::ProcessContext;
use crate::error::StageFailure;
use crate::factory::FactoryInner;

/// Erased stage lambda: `(context, incoming payload, incoming state) → new state`.
pub(crate) type ErasedStageFn = Box<
    dyn Fn(&mut ProcessContext<'_>, Value, Option<&Value>) -> Result<Value, StageFailure>
        + Send
        + Sync,
>;

/// One message consumer in an endpoint's chain.
pub(crate) struct Stage {
    /// `endpointId` for stage 0, `"<endpointId>.stage<i>"` after.
    pub(crate) id: String,
    pub(crate) index: usize,
    pub(crate) endpoint_id: String,
    /// The sibling a request's reply (or a next) continues to. `None` for
    /// the terminal stage.
    pub(crate) next_stage_id: Option<String>,
    /// Whether this stage consumes from a topic.
    pub(crate) subscription: bool,
    /// Per-stage concurrency override.
    pub(crate) concurrency: Option<usize>,
    pub(crate) lambda: ErasedStageFn,
}

impl Stage {
    /// The logical channel this stage consumes from.
    pub(crate) fn channel(&self) -> Channel {
        if self.subscription {
            Channel::topic(self.id.clone())
        } else {
            Channel::queue(self.id.clone())
        }
    }
}

/// A sealed endpoint: id, stages, and its running processors.
pub(crate) struct Endpoint {
    pub(crate) id: String,
    pub(crate) subscription: bool,
    /// Per-endpoint concurrency override.
    pub(crate) concurrency: Option<usize>,
    pub(crate) stages: Vec<Arc<Stage>>,
    pub(crate) started: AtomicBool,
    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for a multi-stage endpoint with state type `S` and reply type `R`.
///
/// Stages are added in order with [`stage`](Self::stage); the chain is
/// sealed with [`last_stage`](Self::last_stage) (which auto-replies with the
/// lambda's return value) or [`finish_setup`](Self::finish_setup). A sealed
/// endpoint registers with its factory and, unless the factory is holding,
/// its processors start immediately.
pub struct EndpointSetup<S, R> {
    inner: Arc<FactoryInner>,
    endpoint_id: String,
    subscription: bool,
    concurrency: Option<usize>,
    specs: Vec<StageSpec>,
    _types: PhantomData<fn(S, R)>,
}

struct StageSpec {
    concurrency: Option<usize>,
    lambda: ErasedStageFn,
}

impl<S, R> EndpointSetup<S, R>
where
    S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    pub(crate) fn new(inner: Arc<FactoryInner>, endpoint_id: &str, subscription: bool) -> Self {
        Self {
            inner,
            endpoint_id: endpoint_id.to_string(),
            subscription,
            concurrency: None,
            specs: Vec::new(),
            _types: PhantomData,
        }
    }

    /// Overrides the factory-wide concurrency for every stage of this
    /// endpoint. Ignored for subscription endpoints (pinned to 1).
    pub fn concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Adds an intermediate stage consuming DTOs of type `I`.
    pub fn stage<I, F>(&mut self, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_spec(None, erase_stage::<S, I, F>(f));
        self
    }

    /// Adds an intermediate stage with its own concurrency.
    pub fn stage_with_concurrency<I, F>(&mut self, concurrency: usize, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_spec(Some(concurrency), erase_stage::<S, I, F>(f));
        self
    }

    /// Adds the terminal stage and seals the endpoint. The lambda's return
    /// value is sent as the reply (dropped silently when the flow has no
    /// continuation left on its stack).
    pub fn last_stage<I, F>(mut self, f: F)
    where
        I: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let erased: ErasedStageFn = Box::new(move |ctx, incoming, state| {
            let mut typed_state: S = mats_serial::deserialize_state(state)?;
            let input: I = mats_serial::deserialize_object(incoming)?;
            let reply = f(ctx, &mut typed_state, input).map_err(StageFailure::User)?;
            ctx.reply(&reply).map_err(StageFailure::User)?;
            Ok(mats_serial::serialize_object(&typed_state)?)
        });
        self.push_spec(None, erased);
        self.finish_setup();
    }

    /// Seals the endpoint: computes stage ids and continuation links,
    /// registers with the factory, and starts processors unless the factory
    /// is holding.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint has no stages, if a subscription endpoint has
    /// more than one stage, or if the endpoint id is already registered.
    pub fn finish_setup(self) {
        let Self {
            inner,
            endpoint_id,
            subscription,
            concurrency,
            specs,
            _types,
        } = self;

        assert!(!specs.is_empty(), "endpoint '{endpoint_id}' has no stages");
        if subscription {
            assert_eq!(
                specs.len(),
                1,
                "subscription endpoint '{endpoint_id}' must have exactly one stage"
            );
        }

        let count = specs.len();
        let mut stages = Vec::with_capacity(count);
        for (index, spec) in specs.into_iter().enumerate() {
            let next_stage_id = (index + 1 < count).then(|| stage_id(&endpoint_id, index + 1));
            stages.push(Arc::new(Stage {
                id: stage_id(&endpoint_id, index),
                index,
                endpoint_id: endpoint_id.clone(),
                next_stage_id,
                subscription: subscription && index == 0,
                concurrency: spec.concurrency,
                lambda: spec.lambda,
            }));
        }

        let endpoint = Arc::new(Endpoint {
            id: endpoint_id,
            subscription,
            concurrency,
            stages,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        });
        FactoryInner::register_endpoint(&inner, endpoint);
    }

    fn push_spec(&mut self, concurrency: Option<usize>, lambda: ErasedStageFn) {
        self.specs.push(StageSpec { concurrency, lambda });
    }
}

/// Stage id scheme: the endpoint id itself for stage 0, then the `.stage<i>`
/// suffix, matching the destination naming so ids and queue names coincide.
fn stage_id(endpoint_id: &str, index: usize) -> String {
    if index == 0 {
        endpoint_id.to_string()
    } else {
        format!("{endpoint_id}.stage{index}")
    }
}

fn erase_stage<S, I, F>(f: F) -> ErasedStageFn
where
    S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    I: DeserializeOwned + Send + Sync + 'static,
    F: Fn(&mut ProcessContext<'_>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Box::new(move |ctx, incoming, state| {
        let mut typed_state: S = mats_serial::deserialize_state(state)?;
        let input: I = mats_serial::deserialize_object(incoming)?;
        f(ctx, &mut typed_state, input).map_err(StageFailure::User)?;
        Ok(mats_serial::serialize_object(&typed_state)?)
    })
}
