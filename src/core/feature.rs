//! # Features
//!
//! A [`Feature`] is an immutable blueprint contributing one slice of state and
//! a set of requests to a store. Features are built once and shared (`Arc`)
//! across any number of stores.
//!
//! ```text
//! Feature
//! ├── name                         // used in collision errors and logs
//! ├── initial_state: StateMap      // seed values
//! ├── get_snapshot(&R) -> StateMap // pull, once per attach
//! ├── subscribe(SubscribeContext)  // push, torn down via the cycle's signal
//! └── requests: Vec<RequestDef>    // canonical, resolved at build time
//! ```
//!
//! A bare handler registered with [`FeatureBuilder::request`] is shorthand
//! for a [`RequestConfig`] keyed by its own name, exclusive, without guards.

use async_trait::async_trait;
use log::warn;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use super::error::BoxError;
use super::meta::RequestMeta;
use super::queue::{ScheduleFn, TaskMode};
use super::signal::AbortSignal;
use super::state::{Snapshot, StateContainer, StateMap};

pub type SnapshotFn<R> = Arc<dyn Fn(&R) -> StateMap + Send + Sync>;
pub type SubscribeFn<R> = Arc<dyn Fn(SubscribeContext<R>) + Send + Sync>;
pub type GuardFn<R> = Arc<dyn Fn(&GuardContext<'_, R>) -> bool + Send + Sync>;

/// Converts a JSON object into a [`StateMap`]. Anything else yields an empty map.
pub fn state_map(value: Value) -> StateMap {
    match value {
        Value::Object(obj) => obj.into_iter().collect(),
        Value::Null => StateMap::new(),
        other => {
            warn!("Expected a JSON object for state, got {}", other);
            StateMap::new()
        }
    }
}

// ============================================================================
// Handler side
// ============================================================================

/// Everything a request handler gets to work with.
pub struct RequestContext<R> {
    key: String,
    target: Arc<R>,
    state: StateContainer,
    signal: AbortSignal,
    meta: Option<RequestMeta>,
}

impl<R> RequestContext<R> {
    pub(crate) fn new(
        key: String,
        target: Arc<R>,
        state: StateContainer,
        signal: AbortSignal,
        meta: Option<RequestMeta>,
    ) -> Self {
        Self {
            key,
            target,
            state,
            signal,
            meta,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &R {
        &self.target
    }

    pub fn target_arc(&self) -> Arc<R> {
        Arc::clone(&self.target)
    }

    /// Current store state, including writes not yet flushed.
    pub fn state(&self) -> Snapshot {
        self.state.current()
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    /// Moves the request metadata out. A second call returns `None`.
    pub fn take_meta(&mut self) -> Option<RequestMeta> {
        self.meta.take()
    }
}

#[async_trait]
pub trait RequestHandler<R: Send + Sync + 'static>: Send + Sync {
    async fn call(&self, input: Value, ctx: RequestContext<R>) -> Result<Value, BoxError>;
}

#[async_trait]
impl<R, F, Fut> RequestHandler<R> for F
where
    R: Send + Sync + 'static,
    F: Fn(Value, RequestContext<R>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send,
{
    async fn call(&self, input: Value, ctx: RequestContext<R>) -> Result<Value, BoxError> {
        (self)(input, ctx).await
    }
}

/// Arguments to a guard predicate.
pub struct GuardContext<'a, R> {
    pub target: &'a R,
    pub state: &'a Snapshot,
}

/// Queue keys aborted before a request's own task is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancels {
    Keys(Vec<String>),
    All,
}

// ============================================================================
// Request configuration
// ============================================================================

/// Full-form request declaration.
pub struct RequestConfig<R: Send + Sync + 'static> {
    handler: Arc<dyn RequestHandler<R>>,
    key: Option<String>,
    mode: TaskMode,
    guards: Vec<GuardFn<R>>,
    schedule: Option<ScheduleFn>,
    cancels: Option<Cancels>,
}

impl<R: Send + Sync + 'static> RequestConfig<R> {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, RequestContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self::from_handler(handler)
    }

    /// Same as [`new`](Self::new) for types implementing [`RequestHandler`] directly.
    pub fn from_handler(handler: impl RequestHandler<R> + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            key: None,
            mode: TaskMode::Exclusive,
            guards: Vec::new(),
            schedule: None,
            cancels: None,
        }
    }

    /// Queue key; defaults to the request name.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    /// Adds a guard. Every guard must pass for the request to be enqueued.
    pub fn guard(mut self, guard: impl Fn(&GuardContext<'_, R>) -> bool + Send + Sync + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn schedule<F, Fut>(mut self, schedule: F) -> Self
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule = Some(Arc::new(move |signal: AbortSignal| -> BoxFuture<'static, ()> {
            Box::pin(schedule(signal))
        }));
        self
    }

    /// Waits `delay` before the handler fires. Combined with exclusive mode
    /// this debounces: only the last call inside the window runs.
    pub fn delay(self, delay: Duration) -> Self {
        self.schedule(move |_signal| tokio::time::sleep(delay))
    }

    pub fn cancels(mut self, cancels: Cancels) -> Self {
        self.cancels = Some(cancels);
        self
    }

    fn resolve(self, name: String) -> RequestDef<R> {
        RequestDef {
            key: self.key.unwrap_or_else(|| name.clone()),
            name,
            mode: self.mode,
            guards: self.guards,
            schedule: self.schedule,
            cancels: self.cancels,
            handler: self.handler,
        }
    }
}

/// Canonical request record. Dispatch never re-inspects the declaration shape.
pub struct RequestDef<R: Send + Sync + 'static> {
    pub name: String,
    pub key: String,
    pub mode: TaskMode,
    pub cancels: Option<Cancels>,
    guards: Vec<GuardFn<R>>,
    schedule: Option<ScheduleFn>,
    handler: Arc<dyn RequestHandler<R>>,
}

impl<R: Send + Sync + 'static> RequestDef<R> {
    pub fn passes_guards(&self, target: &R, state: &Snapshot) -> bool {
        let ctx = GuardContext { target, state };
        self.guards.iter().all(|guard| guard(&ctx))
    }

    pub fn schedule(&self) -> Option<ScheduleFn> {
        self.schedule.clone()
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler<R>> {
        Arc::clone(&self.handler)
    }
}

// ============================================================================
// Subscribe side
// ============================================================================

/// Push callback handed to a feature's `subscribe`.
///
/// Inert once the attach cycle it belongs to has been aborted, so a listener
/// that outlives its cycle cannot write into the next one.
pub struct Updater<R> {
    target: Arc<R>,
    state: StateContainer,
    signal: AbortSignal,
    pull: Option<SnapshotFn<R>>,
}

impl<R> Clone for Updater<R> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            state: self.state.clone(),
            signal: self.signal.clone(),
            pull: self.pull.clone(),
        }
    }
}

impl<R> Updater<R> {
    pub(crate) fn new(
        target: Arc<R>,
        state: StateContainer,
        signal: AbortSignal,
        pull: Option<SnapshotFn<R>>,
    ) -> Self {
        Self {
            target,
            state,
            signal,
            pull,
        }
    }

    /// Re-pulls the feature's snapshot from the target and patches it in.
    pub fn update(&self) {
        if self.signal.is_aborted() {
            return;
        }
        if let Some(pull) = &self.pull {
            self.state.patch(pull(&self.target));
        }
    }

    pub fn patch(&self, partial: StateMap) {
        if self.signal.is_aborted() {
            return;
        }
        self.state.patch(partial);
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if self.signal.is_aborted() {
            return;
        }
        self.state.set(key, value);
    }
}

pub struct SubscribeContext<R> {
    pub target: Arc<R>,
    pub update: Updater<R>,
    pub signal: AbortSignal,
}

// ============================================================================
// Feature
// ============================================================================

pub struct Feature<R: Send + Sync + 'static> {
    name: String,
    initial_state: StateMap,
    get_snapshot: Option<SnapshotFn<R>>,
    subscribe: Option<SubscribeFn<R>>,
    requests: Vec<RequestDef<R>>,
}

impl<R: Send + Sync + 'static> Feature<R> {
    pub fn builder(name: impl Into<String>) -> FeatureBuilder<R> {
        FeatureBuilder {
            feature: Feature {
                name: name.into(),
                initial_state: StateMap::new(),
                get_snapshot: None,
                subscribe: None,
                requests: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &StateMap {
        &self.initial_state
    }

    pub fn requests(&self) -> &[RequestDef<R>] {
        &self.requests
    }

    pub(crate) fn snapshot_fn(&self) -> Option<SnapshotFn<R>> {
        self.get_snapshot.clone()
    }

    pub fn get_snapshot(&self, target: &R) -> StateMap {
        match &self.get_snapshot {
            Some(pull) => pull(target),
            None => StateMap::new(),
        }
    }

    pub(crate) fn subscribe(&self, ctx: SubscribeContext<R>) {
        if let Some(subscribe) = &self.subscribe {
            subscribe(ctx);
        }
    }
}

pub struct FeatureBuilder<R: Send + Sync + 'static> {
    feature: Feature<R>,
}

impl<R: Send + Sync + 'static> FeatureBuilder<R> {
    /// Seeds state from a JSON object.
    pub fn initial_state(mut self, state: Value) -> Self {
        self.feature.initial_state.extend(state_map(state));
        self
    }

    pub fn state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.feature.initial_state.insert(key.into(), value);
        self
    }

    pub fn get_snapshot(mut self, pull: impl Fn(&R) -> StateMap + Send + Sync + 'static) -> Self {
        self.feature.get_snapshot = Some(Arc::new(pull));
        self
    }

    pub fn subscribe(mut self, subscribe: impl Fn(SubscribeContext<R>) + Send + Sync + 'static) -> Self {
        self.feature.subscribe = Some(Arc::new(subscribe));
        self
    }

    /// Bare handler: keyed by `name`, exclusive, no guards.
    pub fn request<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, RequestContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.request_with(name, RequestConfig::new(handler))
    }

    pub fn request_handler(self, name: impl Into<String>, handler: impl RequestHandler<R> + 'static) -> Self {
        self.request_with(name, RequestConfig::from_handler(handler))
    }

    pub fn request_with(mut self, name: impl Into<String>, config: RequestConfig<R>) -> Self {
        self.feature.requests.push(config.resolve(name.into()));
        self
    }

    pub fn build(self) -> Arc<Feature<R>> {
        Arc::new(self.feature)
    }
}
