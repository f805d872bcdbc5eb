//! # Store
//!
//! Composes features into one object bound to at most one target at a time.
//!
//! ```text
//! Store<R>
//! ├── state: StateContainer         // single container for all features
//! ├── queue: TaskQueue              // store → queue only, never back
//! ├── routes: HashMap<name, Route>  // flat request lookup
//! ├── attachment: Option<{ target: Arc<R>, controller, cycle }>
//! └── hooks: on_task_start / on_task_end / on_error
//! ```
//!
//! Request dispatch:
//!
//! ```text
//! request(name) ─► destroyed? ─► route? ─► target? ─► guards ─► cancels ─► enqueue
//!                   Destroyed    Unknown   NoResource  no-op     abort keys
//! ```
//!
//! Synchronous failures come back from `request` itself. Cancellation and
//! handler failures only come back through the returned [`RequestHandle`].

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use serde_json::Value;

use super::config::ResolvedConfig;
use super::error::{ConfigurationError, StoreError};
use super::feature::{Cancels, Feature, RequestContext, RequestDef, SubscribeContext, Updater};
use super::meta::RequestMeta;
use super::queue::{QueueError, TaskError, TaskHandle, TaskInfo, TaskQueue, TaskSpec};
use super::signal::{AbortController, AbortSignal};
use super::state::{ChangeSet, Snapshot, StateContainer, StateMap, Subscription};

pub const DEFAULT_STORE_NAME: &str = "store";

/// Lifecycle phase of a task, reported to the task hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Started,
    Succeeded,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub request: String,
    pub key: String,
    pub meta: Option<RequestMeta>,
    pub status: TaskStatus,
}

/// Passed to the store-level error hook.
pub struct ErrorContext<'a, R: Send + Sync + 'static> {
    pub store: &'a Store<R>,
    pub error: &'a StoreError,
}

type TaskHook = Arc<dyn Fn(&TaskEvent) + Send + Sync>;
type ErrorHook<R> = Arc<dyn Fn(ErrorContext<'_, R>) + Send + Sync>;

struct StoreHooks<R: Send + Sync + 'static> {
    on_task_start: Option<TaskHook>,
    on_task_end: Option<TaskHook>,
    on_error: Option<ErrorHook<R>>,
}

/// Index of a request inside `features`.
#[derive(Debug, Clone, Copy)]
struct Route {
    feature: usize,
    request: usize,
}

struct Attachment<R> {
    target: Arc<R>,
    controller: AbortController,
    cycle: u64,
}

struct StoreInner<R: Send + Sync + 'static> {
    name: String,
    state: StateContainer,
    queue: TaskQueue,
    initial: StateMap,
    features: Vec<Arc<Feature<R>>>,
    routes: HashMap<String, Route>,
    attachment: Mutex<Option<Attachment<R>>>,
    /// Serializes attach / detach / destroy.
    lifecycle: Mutex<()>,
    cycle: AtomicU64,
    destroyed: AtomicBool,
    hooks: StoreHooks<R>,
}

impl<R: Send + Sync + 'static> Drop for StoreInner<R> {
    fn drop(&mut self) {
        let attachment = match self.attachment.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(attachment) = attachment {
            attachment.controller.abort();
        }
        self.queue.destroy();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Store lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Shared handle to a store. Clones refer to the same store.
pub struct Store<R: Send + Sync + 'static> {
    inner: Arc<StoreInner<R>>,
}

impl<R: Send + Sync + 'static> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + Sync + 'static> Store<R> {
    pub fn builder() -> StoreBuilder<R> {
        StoreBuilder {
            name: DEFAULT_STORE_NAME.to_string(),
            auto_flush: true,
            features: Vec::new(),
            hooks: StoreHooks {
                on_task_start: None,
                on_task_end: None,
                on_error: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn state(&self) -> Snapshot {
        self.inner.state.current()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state.subscribe(listener)
    }

    pub fn subscribe_keys<I, K>(
        &self,
        keys: I,
        listener: impl Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    ) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.inner.state.subscribe_keys(keys, listener)
    }

    /// Delivers pending notifications synchronously.
    pub fn flush(&self) -> bool {
        self.inner.state.flush()
    }

    /// Active tasks in enqueue order.
    pub fn pending(&self) -> Vec<TaskInfo> {
        self.inner.queue.active()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn target(&self) -> Option<Arc<R>> {
        lock(&self.inner.attachment)
            .as_ref()
            .map(|a| Arc::clone(&a.target))
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.inner.attachment).is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Binds `target`, detaching any previous one first.
    ///
    /// Pulls every feature's snapshot, resets state to the composed initial
    /// values plus those pulls, then wires every feature's subscription under
    /// one abort scope for the whole cycle.
    pub fn attach(&self, target: Arc<R>) -> Result<DetachHandle<R>, StoreError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        if self.is_destroyed() {
            return Err(StoreError::Destroyed);
        }
        self.detach_locked();

        let cycle = self.inner.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let controller = AbortController::new();
        let signal = controller.signal();

        let mut next = self.inner.initial.clone();
        for feature in &self.inner.features {
            next.extend(feature.get_snapshot(&target));
        }
        self.inner.state.reset(next);

        *lock(&self.inner.attachment) = Some(Attachment {
            target: Arc::clone(&target),
            controller,
            cycle,
        });

        for feature in &self.inner.features {
            feature.subscribe(SubscribeContext {
                target: Arc::clone(&target),
                update: Updater::new(
                    Arc::clone(&target),
                    self.inner.state.clone(),
                    signal.clone(),
                    feature.snapshot_fn(),
                ),
                signal: signal.clone(),
            });
        }

        info!(
            "Store `{}` attached (cycle {}, {} feature(s))",
            self.inner.name,
            cycle,
            self.inner.features.len()
        );
        Ok(DetachHandle {
            store: Arc::downgrade(&self.inner),
            cycle,
        })
    }

    /// Releases the current target. Returns `false` if nothing was attached.
    pub fn detach(&self) -> bool {
        let _lifecycle = lock(&self.inner.lifecycle);
        self.detach_locked()
    }

    fn detach_locked(&self) -> bool {
        let Some(attachment) = lock(&self.inner.attachment).take() else {
            return false;
        };
        // Tear down feature listeners first so no late push lands in the reset state.
        attachment.controller.abort();
        let aborted = self.inner.queue.abort_all();
        self.inner.state.reset(self.inner.initial.clone());
        info!(
            "Store `{}` detached (cycle {}, {} task(s) aborted)",
            self.inner.name, attachment.cycle, aborted
        );
        true
    }

    /// Detaches, shuts the queue down, and tears the state container down.
    /// Idempotent; the store is permanently inert afterwards.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Store `{}` already destroyed", self.inner.name);
            return;
        }
        let _lifecycle = lock(&self.inner.lifecycle);
        self.detach_locked();
        self.inner.queue.destroy();
        self.inner.state.destroy();
        info!("Store `{}` destroyed", self.inner.name);
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Issues a request without metadata.
    pub fn request(&self, name: &str, input: Value) -> Result<RequestHandle, StoreError> {
        self.dispatch(name, input, None)
    }

    /// Stages metadata for exactly one request issued through the returned handle.
    pub fn meta(&self, meta: RequestMeta) -> MetaRequest<'_, R> {
        MetaRequest { store: self, meta }
    }

    fn dispatch(
        &self,
        name: &str,
        input: Value,
        meta: Option<RequestMeta>,
    ) -> Result<RequestHandle, StoreError> {
        if self.is_destroyed() {
            return Err(StoreError::Destroyed);
        }
        let route = *self
            .inner
            .routes
            .get(name)
            .ok_or_else(|| StoreError::UnknownRequest(name.to_string()))?;
        let def: &RequestDef<R> = &self.inner.features[route.feature].requests()[route.request];
        let target = self.target().ok_or_else(|| StoreError::NoResource {
            request: name.to_string(),
        })?;

        if !def.passes_guards(&target, &self.inner.state.current()) {
            debug!("Request `{}` skipped: guard rejected", name);
            return Ok(RequestHandle {
                state: HandleState::Skipped,
            });
        }

        // Checked before `cancels` so a request that cannot run aborts nothing.
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StoreError::NoRuntime {
                request: name.to_string(),
            });
        }

        match &def.cancels {
            Some(Cancels::All) => {
                self.inner.queue.abort_all();
            }
            Some(Cancels::Keys(keys)) => {
                for key in keys {
                    self.inner.queue.abort(key);
                }
            }
            None => {}
        }

        let request = name.to_string();
        let key = def.key.clone();
        let handler = def.handler();
        let state = self.inner.state.clone();
        let hook_meta = meta.clone();

        let start_store = self.clone();
        let start_event = TaskEvent {
            request: request.clone(),
            key: key.clone(),
            meta: meta.clone(),
            status: TaskStatus::Started,
        };
        let body_key = key.clone();
        let body = move |signal: AbortSignal| async move {
            start_store.emit(start_store.inner.hooks.on_task_start.as_ref(), &start_event);
            let ctx = RequestContext::new(body_key, target, state, signal, meta);
            handler.call(input, ctx).await
        };

        let settle_store = self.clone();
        let settle_request = request.clone();
        let settle_key = key.clone();
        let settle_meta = hook_meta.clone();
        let spec = TaskSpec::new(key.clone(), body)
            .mode(def.mode)
            .meta(hook_meta.clone())
            .schedule(def.schedule())
            .on_settle(move |outcome| {
                settle_store.settle(settle_request, settle_key, settle_meta, outcome)
            });

        let handle = self.inner.queue.enqueue(spec).map_err(|e| match e {
            QueueError::Destroyed => StoreError::Destroyed,
            QueueError::NoRuntime => StoreError::NoRuntime {
                request: request.clone(),
            },
        })?;
        debug!("Request `{}` dispatched under key `{}`", request, key);
        Ok(RequestHandle {
            state: HandleState::Queued {
                handle,
                meta: hook_meta,
            },
        })
    }

    fn settle(
        &self,
        request: String,
        key: String,
        meta: Option<RequestMeta>,
        outcome: &Result<Value, TaskError>,
    ) {
        // Subscribers hear about the task's writes before its caller does.
        self.inner.state.flush();

        let status = match outcome {
            Ok(_) => TaskStatus::Succeeded,
            Err(e) if e.is_cancelled() => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        let event = TaskEvent {
            request,
            key,
            meta: meta.clone(),
            status,
        };
        self.emit(self.inner.hooks.on_task_end.as_ref(), &event);

        if let Err(e) = outcome {
            self.report(&StoreError::from_task(e.clone(), meta));
        }
    }

    fn emit(&self, hook: Option<&TaskHook>, event: &TaskEvent) {
        if let Some(hook) = hook {
            hook(event);
        }
    }

    /// Routes an async failure to the error hook, or logs it when none is set.
    fn report(&self, error: &StoreError) {
        match &self.inner.hooks.on_error {
            Some(hook) => hook(ErrorContext { store: self, error }),
            None if error.is_cancellation() => {
                debug!("Store `{}`: {}", self.inner.name, error)
            }
            None => error!("Store `{}`: {}", self.inner.name, error),
        }
    }
}

/// Returned by [`Store::attach`]. Detaches only the cycle it was issued for.
pub struct DetachHandle<R: Send + Sync + 'static> {
    store: Weak<StoreInner<R>>,
    cycle: u64,
}

impl<R: Send + Sync + 'static> DetachHandle<R> {
    /// Returns `false` if the store is gone or has since moved to another cycle.
    pub fn detach(self) -> bool {
        let Some(inner) = self.store.upgrade() else {
            return false;
        };
        let store = Store { inner };
        let _lifecycle = lock(&store.inner.lifecycle);
        let current = lock(&store.inner.attachment).as_ref().map(|a| a.cycle);
        if current != Some(self.cycle) {
            debug!("Stale detach for cycle {} ignored", self.cycle);
            return false;
        }
        store.detach_locked()
    }
}

/// One-shot carrier for staged metadata. Consumed by its `request` call.
pub struct MetaRequest<'a, R: Send + Sync + 'static> {
    store: &'a Store<R>,
    meta: RequestMeta,
}

impl<R: Send + Sync + 'static> MetaRequest<'_, R> {
    pub fn request(self, name: &str, input: Value) -> Result<RequestHandle, StoreError> {
        self.store.dispatch(name, input, Some(self.meta))
    }
}

enum HandleState {
    /// A guard vetoed the request; nothing was enqueued.
    Skipped,
    Queued {
        handle: TaskHandle<Value>,
        meta: Option<RequestMeta>,
    },
}

/// Resolves with the handler's return value.
///
/// Requests vetoed by a guard resolve immediately to `Value::Null`.
#[must_use = "a RequestHandle does nothing unless awaited"]
pub struct RequestHandle {
    state: HandleState,
}

impl RequestHandle {
    /// True when a guard vetoed the request.
    pub fn is_skipped(&self) -> bool {
        matches!(self.state, HandleState::Skipped)
    }
}

impl Future for RequestHandle {
    type Output = Result<Value, StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Skipped => Poll::Ready(Ok(Value::Null)),
            HandleState::Queued { handle, meta } => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
                Poll::Ready(Err(e)) => Poll::Ready(Err(StoreError::from_task(e, meta.take()))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct StoreBuilder<R: Send + Sync + 'static> {
    name: String,
    auto_flush: bool,
    features: Vec<Arc<Feature<R>>>,
    hooks: StoreHooks<R>,
}

impl<R: Send + Sync + 'static> StoreBuilder<R> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// With `false`, notifications go out only on [`Store::flush`] and at task settlement.
    pub fn auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    pub fn config(self, config: &ResolvedConfig) -> Self {
        self.name(config.name.clone()).auto_flush(config.auto_flush)
    }

    pub fn feature(mut self, feature: Arc<Feature<R>>) -> Self {
        self.features.push(feature);
        self
    }

    pub fn features(mut self, features: impl IntoIterator<Item = Arc<Feature<R>>>) -> Self {
        self.features.extend(features);
        self
    }

    pub fn on_task_start(mut self, hook: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        self.hooks.on_task_start = Some(Arc::new(hook));
        self
    }

    pub fn on_task_end(mut self, hook: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        self.hooks.on_task_end = Some(Arc::new(hook));
        self
    }

    /// Replaces the default error log for cancellations and handler failures.
    pub fn on_error(mut self, hook: impl Fn(ErrorContext<'_, R>) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Merges features. Any state key or request name declared twice is an error.
    pub fn build(self) -> Result<Store<R>, StoreError> {
        let mut initial = StateMap::new();
        let mut key_owners: HashMap<String, usize> = HashMap::new();
        let mut routes: HashMap<String, Route> = HashMap::new();

        for (index, feature) in self.features.iter().enumerate() {
            for (key, value) in feature.initial_state() {
                if let Some(&owner) = key_owners.get(key) {
                    return Err(ConfigurationError::DuplicateStateKey {
                        key: key.clone(),
                        first: self.features[owner].name().to_string(),
                        second: feature.name().to_string(),
                    }
                    .into());
                }
                key_owners.insert(key.clone(), index);
                initial.insert(key.clone(), value.clone());
            }

            for (position, def) in feature.requests().iter().enumerate() {
                if let Some(existing) = routes.get(&def.name) {
                    return Err(ConfigurationError::DuplicateRequest {
                        name: def.name.clone(),
                        first: self.features[existing.feature].name().to_string(),
                        second: feature.name().to_string(),
                    }
                    .into());
                }
                routes.insert(
                    def.name.clone(),
                    Route {
                        feature: index,
                        request: position,
                    },
                );
            }
        }

        debug!(
            "Store `{}` composed: {} feature(s), {} state key(s), {} request(s)",
            self.name,
            self.features.len(),
            initial.len(),
            routes.len()
        );

        Ok(Store {
            inner: Arc::new(StoreInner {
                state: StateContainer::with_auto_flush(initial.clone(), self.auto_flush),
                queue: TaskQueue::new(),
                name: self.name,
                initial,
                features: self.features,
                routes,
                attachment: Mutex::new(None),
                lifecycle: Mutex::new(()),
                cycle: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                hooks: self.hooks,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BoxError;
    use crate::core::feature::RequestConfig;
    use crate::test_support::{MockMedia, muted_feature, playback_feature, test_media, volume_feature};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn media_store() -> Store<MockMedia> {
        Store::builder()
            .auto_flush(false)
            .feature(volume_feature())
            .feature(muted_feature())
            .feature(playback_feature())
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_duplicate_state_key() {
        let result = Store::<MockMedia>::builder()
            .feature(volume_feature())
            .feature(volume_feature())
            .build();
        match result {
            Err(StoreError::Configuration(ConfigurationError::DuplicateStateKey { key, .. })) => {
                assert_eq!(key, "volume")
            }
            Err(other) => panic!("expected duplicate key, got {other:?}"),
            Ok(_) => panic!("expected duplicate key error"),
        }
    }

    #[test]
    fn test_build_rejects_duplicate_request_name() {
        let shadow = Feature::<MockMedia>::builder("shadow")
            .request("toggleMuted", |_input: Value, _ctx: RequestContext<MockMedia>| async {
                Ok::<Value, BoxError>(Value::Null)
            })
            .build();
        let result = Store::builder().feature(muted_feature()).feature(shadow).build();
        match result {
            Err(StoreError::Configuration(ConfigurationError::DuplicateRequest { name, first, second })) => {
                assert_eq!(name, "toggleMuted");
                assert_eq!(first, "muted");
                assert_eq!(second, "shadow");
            }
            Err(other) => panic!("expected duplicate request, got {other:?}"),
            Ok(_) => panic!("expected duplicate request error"),
        }
    }

    #[test]
    fn test_state_before_attach_is_composed_initial() {
        let store = media_store();
        let state = store.state();
        assert_eq!(state.get("volume"), Some(&json!(1.0)));
        assert_eq!(state.get("muted"), Some(&json!(false)));
        assert_eq!(state.get("paused"), Some(&json!(true)));
        assert!(!store.is_attached());
    }

    #[tokio::test]
    async fn test_synchronous_request_failures() {
        let store = media_store();
        assert!(matches!(
            store.request("setVolume", json!(0.5)),
            Err(StoreError::NoResource { .. })
        ));
        assert!(matches!(
            store.request("seek", json!(10)),
            Err(StoreError::UnknownRequest(name)) if name == "seek"
        ));
    }

    #[tokio::test]
    async fn test_attach_pulls_and_detach_resets() {
        let store = media_store();
        let media = Arc::new(MockMedia::new(0.3, true));

        let _handle = store.attach(Arc::clone(&media)).unwrap();
        assert!(store.is_attached());
        assert_eq!(store.state().get("volume"), Some(&json!(0.3)));
        assert_eq!(store.state().get("muted"), Some(&json!(true)));
        // volume + muted on "volumechange", playback on "play" and "pause"
        assert_eq!(media.listener_count(), 4);

        assert!(store.detach());
        assert!(!store.is_attached());
        assert_eq!(media.listener_count(), 0);
        assert_eq!(store.state().get("volume"), Some(&json!(1.0)));
        assert!(!store.detach());
    }

    #[tokio::test]
    async fn test_target_events_reach_state_and_subscribers() {
        let store = media_store();
        let media = test_media();
        let _handle = store.attach(Arc::clone(&media)).unwrap();
        store.flush();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store.subscribe_keys(["volume"], move |snapshot, _changed| {
            s.lock().unwrap().push(snapshot.get("volume").cloned());
        });

        media.set_volume(0.4);
        assert_eq!(store.state().get("volume"), Some(&json!(0.4)));
        assert!(seen.lock().unwrap().is_empty());
        store.flush();
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(0.4))]);
    }

    #[tokio::test]
    async fn test_request_resolves_after_state_is_flushed() {
        let store = media_store();
        let media = test_media();
        let _handle = store.attach(Arc::clone(&media)).unwrap();
        store.flush();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store.subscribe(move |snapshot, changed| {
            assert!(changed.contains("volume"));
            s.lock().unwrap().push(snapshot.get("volume").cloned());
        });

        let value = store.request("setVolume", json!(0.6)).unwrap().await.unwrap();
        assert_eq!(value, json!(0.6));
        assert_eq!(media.volume(), 0.6);
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(0.6))]);
        assert!(store.pending().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_requests_supersede() {
        let store = media_store();
        let media = test_media();
        let _handle = store.attach(Arc::clone(&media)).unwrap();

        let first = store.request("setVolume", json!(0.2)).unwrap();
        let second = store.request("setVolume", json!(0.9)).unwrap();
        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "setVolume");

        assert!(matches!(first.await, Err(StoreError::Cancelled { key }) if key == "setVolume"));
        assert_eq!(second.await.unwrap(), json!(0.9));
        assert_eq!(media.volume(), 0.9);
    }

    #[tokio::test]
    async fn test_guard_rejection_is_a_noop() {
        let store = media_store();
        let media = test_media();
        media.set_ready(false);
        let _handle = store.attach(Arc::clone(&media)).unwrap();

        let handle = store.request("play", Value::Null).unwrap();
        assert!(handle.is_skipped());
        assert!(store.pending().is_empty());
        assert_eq!(handle.await.unwrap(), Value::Null);
        assert!(media.paused());
    }

    #[tokio::test]
    async fn test_stale_detach_handle_is_ignored() {
        let store = media_store();
        let a = test_media();
        let b = test_media();

        let first = store.attach(Arc::clone(&a)).unwrap();
        let second = store.attach(Arc::clone(&b)).unwrap();
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 4);

        assert!(!first.detach());
        assert!(store.is_attached());
        assert!(Arc::ptr_eq(&store.target().unwrap(), &b));

        assert!(second.detach());
        assert!(!store.is_attached());
    }

    #[tokio::test]
    async fn test_detach_cancels_in_flight_requests() {
        let store = media_store();
        let _handle = store.attach(test_media()).unwrap();
        let pending = store.request("setVolume", json!(0.1)).unwrap();
        store.detach();
        assert!(pending.await.unwrap_err().is_cancellation());
        assert!(store.pending().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_final() {
        let store = media_store();
        let media = test_media();
        let _handle = store.attach(Arc::clone(&media)).unwrap();

        store.destroy();
        store.destroy();
        assert!(store.is_destroyed());
        assert!(!store.is_attached());
        assert_eq!(media.listener_count(), 0);
        assert!(matches!(store.request("setVolume", json!(0.5)), Err(StoreError::Destroyed)));
        assert!(matches!(store.attach(test_media()), Err(StoreError::Destroyed)));
    }

    #[tokio::test]
    async fn test_meta_is_recorded_and_consumed_once() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let feature = Feature::<MockMedia>::builder("inspect")
            .request("inspect", move |_input: Value, mut ctx: RequestContext<MockMedia>| {
                let s = Arc::clone(&s);
                async move {
                    let first = ctx.take_meta().map(|m| m.source);
                    let second = ctx.take_meta().map(|m| m.source);
                    s.lock().unwrap().push((first, second));
                    Ok::<Value, BoxError>(Value::Null)
                }
            })
            .build();
        let store = Store::builder().auto_flush(false).feature(feature).build().unwrap();
        let _handle = store.attach(test_media()).unwrap();

        let handle = store
            .meta(RequestMeta::new("user").with_reason("click"))
            .request("inspect", Value::Null)
            .unwrap();
        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].meta.as_ref().map(|m| m.source.as_str()), Some("user"));
        handle.await.unwrap();

        store.request("inspect", Value::Null).unwrap().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some("user".to_string()), None), (None, None)]
        );
    }

    #[tokio::test]
    async fn test_cancels_aborts_named_keys_first() {
        let store = media_store();
        let _handle = store.attach(test_media()).unwrap();

        let play = store.request("play", Value::Null).unwrap();
        let pause = store.request("pause", Value::Null).unwrap();
        assert!(play.await.unwrap_err().is_cancellation());
        pause.await.unwrap();
        assert_eq!(store.state().get("paused"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_hooks_observe_lifecycle_and_errors() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let failing = Feature::<MockMedia>::builder("loader")
            .request_with(
                "load",
                RequestConfig::new(|_input: Value, _ctx: RequestContext<MockMedia>| async {
                    Err::<Value, BoxError>("network down".into())
                })
                .key("source"),
            )
            .build();

        let (start, end, errs) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&errors));
        let store = Store::builder()
            .auto_flush(false)
            .feature(failing)
            .on_task_start(move |e| start.lock().unwrap().push((e.key.clone(), e.status)))
            .on_task_end(move |e| end.lock().unwrap().push((e.key.clone(), e.status)))
            .on_error(move |ctx| {
                assert!(ctx.store.is_attached());
                errs.lock().unwrap().push(ctx.error.to_string());
            })
            .build()
            .unwrap();
        let _handle = store.attach(test_media()).unwrap();

        let err = store.request("load", Value::Null).unwrap().await.unwrap_err();
        assert!(err.is_handler_failure());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("source".to_string(), TaskStatus::Started),
                ("source".to_string(), TaskStatus::Failed)
            ]
        );
        assert_eq!(*errors.lock().unwrap(), vec!["task `source` failed: network down"]);
    }

    #[test]
    fn test_config_applies_name_and_flush_mode() {
        let config = ResolvedConfig {
            name: "player".to_string(),
            auto_flush: false,
            ..Default::default()
        };
        let store = Store::<MockMedia>::builder()
            .config(&config)
            .feature(volume_feature())
            .build()
            .unwrap();
        assert_eq!(store.name(), "player");
    }

    #[test]
    fn test_request_outside_runtime_fails_without_side_effects() {
        let store = media_store();
        let media = test_media();
        let _handle = store.attach(Arc::clone(&media)).unwrap();

        match store.request("pause", Value::Null) {
            Err(StoreError::NoRuntime { request }) => assert_eq!(request, "pause"),
            Err(other) => panic!("expected NoRuntime, got {other:?}"),
            Ok(_) => panic!("expected NoRuntime"),
        }
        assert!(store.pending().is_empty());
        assert!(store.is_attached());
    }
}
