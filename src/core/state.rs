//! # State Container
//!
//! Holds the store's state as an immutable [`Snapshot`] and coalesces change
//! notifications.
//!
//! ```text
//! set / patch / delete ──► new Snapshot (visible immediately)
//!                      └─► changed keys += k ──► PENDING registry
//!                                                    │ one drain per turn
//!                                                    ▼
//!                               flush(): global subscribers (all changed keys)
//!                                        key subscribers (only on intersection)
//! ```
//!
//! Writers always read their own writes. Subscribers hear about a burst of
//! writes once, after the writing task yields. [`StateContainer::flush`] and
//! [`flush_pending`] deliver synchronously for deterministic tests.

use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use serde_json::Value;

/// Field name → value.
pub type StateMap = BTreeMap<String, Value>;

/// Keys changed since the last flush.
pub type ChangeSet = BTreeSet<String>;

type Listener = Arc<dyn Fn(&Snapshot, &ChangeSet) + Send + Sync>;

/// An immutable view of the state at one point in time.
///
/// Cloning is cheap. A snapshot is never mutated after it is handed out, so
/// holding an old one gives a consistent past view.
#[derive(Clone, Default, PartialEq)]
pub struct Snapshot(Arc<StateMap>);

impl Snapshot {
    pub fn new(map: StateMap) -> Self {
        Self(Arc::new(map))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub(crate) fn as_map(&self) -> &StateMap {
        &self.0
    }

    /// Converts to a JSON object, e.g. for `assert_eq!` against `json!({...})`.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

struct SubscriberEntry {
    id: u64,
    /// `None` = global subscriber.
    keys: Option<BTreeSet<String>>,
    listener: Listener,
}

struct ContainerState {
    current: Snapshot,
    changed: ChangeSet,
    subscribers: Vec<SubscriberEntry>,
    next_id: u64,
    destroyed: bool,
}

pub(crate) struct ContainerInner {
    state: Mutex<ContainerState>,
    auto_flush: bool,
}

impl ContainerInner {
    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("State container lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Shared handle to one state container. Clones refer to the same state.
#[derive(Clone)]
pub struct StateContainer {
    inner: Arc<ContainerInner>,
}

impl StateContainer {
    /// Creates a container that schedules its own flushes on the ambient tokio runtime.
    pub fn new(initial: StateMap) -> Self {
        Self::with_auto_flush(initial, true)
    }

    /// With `auto_flush = false` the container stays out of the pending
    /// registry; notifications only go out on an explicit [`flush`](Self::flush).
    pub fn with_auto_flush(initial: StateMap, auto_flush: bool) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                state: Mutex::new(ContainerState {
                    current: Snapshot::new(initial),
                    changed: ChangeSet::new(),
                    subscribers: Vec::new(),
                    next_id: 0,
                    destroyed: false,
                }),
                auto_flush,
            }),
        }
    }

    /// Always-fresh snapshot, including writes not yet flushed.
    pub fn current(&self) -> Snapshot {
        self.inner.lock().current.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().current.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.write(|state| {
            if state.current.get(&key) == Some(&value) {
                return;
            }
            Arc::make_mut(&mut state.current.0).insert(key.clone(), value);
            state.changed.insert(key);
        });
    }

    /// Applies every entry that differs from the current value.
    pub fn patch(&self, partial: StateMap) {
        self.write(|state| {
            let changes: Vec<(String, Value)> = partial
                .into_iter()
                .filter(|(k, v)| state.current.get(k) != Some(v))
                .collect();
            if changes.is_empty() {
                return;
            }
            let map = Arc::make_mut(&mut state.current.0);
            for (key, value) in changes {
                map.insert(key.clone(), value);
                state.changed.insert(key);
            }
        });
    }

    pub fn delete(&self, key: &str) {
        self.write(|state| {
            if !state.current.contains_key(key) {
                return;
            }
            Arc::make_mut(&mut state.current.0).remove(key);
            state.changed.insert(key.to_string());
        });
    }

    /// Replaces the whole state, recording every key that differs.
    pub(crate) fn reset(&self, next: StateMap) {
        self.write(|state| {
            let previous = state.current.as_map();
            let mut changed: Vec<String> = previous
                .iter()
                .filter(|(k, v)| next.get(*k) != Some(*v))
                .map(|(k, _)| k.clone())
                .collect();
            changed.extend(
                next.keys()
                    .filter(|k| !previous.contains_key(*k))
                    .cloned(),
            );
            if changed.is_empty() {
                return;
            }
            state.current = Snapshot::new(next);
            state.changed.extend(changed);
        });
    }

    fn write(&self, apply: impl FnOnce(&mut ContainerState)) {
        let register = {
            let mut state = self.inner.lock();
            if state.destroyed {
                debug!("Write ignored: state container destroyed");
                return;
            }
            apply(&mut state);
            self.inner.auto_flush && !state.changed.is_empty()
        };
        if register {
            register_pending(&self.inner);
        }
    }

    /// Subscribes to every flush. The listener gets the full changed-key set.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_subscriber(None, Arc::new(listener))
    }

    /// Subscribes to flushes that touch at least one of `keys`.
    pub fn subscribe_keys<I, K>(
        &self,
        keys: I,
        listener: impl Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    ) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        self.add_subscriber(Some(keys), Arc::new(listener))
    }

    fn add_subscriber(&self, keys: Option<BTreeSet<String>>, listener: Listener) -> Subscription {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.destroyed {
            state.subscribers.push(SubscriberEntry { id, keys, listener });
        }
        Subscription {
            container: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.lock().changed.is_empty()
    }

    /// Delivers pending notifications now. Returns `false` if nothing changed.
    pub fn flush(&self) -> bool {
        let (snapshot, changed, global, keyed) = {
            let mut state = self.inner.lock();
            if state.changed.is_empty() {
                return false;
            }
            let changed = std::mem::take(&mut state.changed);
            let mut global = Vec::new();
            let mut keyed = Vec::new();
            for entry in &state.subscribers {
                match &entry.keys {
                    None => global.push(Arc::clone(&entry.listener)),
                    Some(keys) if !keys.is_disjoint(&changed) => {
                        keyed.push(Arc::clone(&entry.listener))
                    }
                    Some(_) => {}
                }
            }
            (state.current.clone(), changed, global, keyed)
        };

        debug!(
            "Flushing {} changed key(s) to {} global, {} keyed subscriber(s)",
            changed.len(),
            global.len(),
            keyed.len()
        );
        // Listeners run without the lock so they may write back.
        for listener in global.iter().chain(keyed.iter()) {
            listener(&snapshot, &changed);
        }
        true
    }

    /// Drops all subscribers and pending changes; later writes are ignored.
    pub(crate) fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        state.subscribers.clear();
        state.changed.clear();
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    container: Weak<ContainerInner>,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.container.upgrade() {
            let id = self.id;
            inner.lock().subscribers.retain(|entry| entry.id != id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

// ============================================================================
// Process-wide pending-flush registry
// ============================================================================
//
// Auto-flush containers with unflushed changes register here, once each.
// With a tokio runtime available, the first registration after a drain
// spawns a single drain task; everything registered before that task runs is
// delivered together. If the runtime goes away before the drain runs, the
// task's guard releases the schedule so the next registration spawns a fresh
// drain on whatever runtime it finds. Without a runtime, `flush_pending()`
// drains.

#[derive(Default)]
struct PendingFlushes {
    entries: Vec<Weak<ContainerInner>>,
    drain_scheduled: bool,
}

static PENDING: LazyLock<Mutex<PendingFlushes>> =
    LazyLock::new(|| Mutex::new(PendingFlushes::default()));

fn pending_registry() -> MutexGuard<'static, PendingFlushes> {
    match PENDING.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Travels inside the drain task. Dropped unrun, it clears `drain_scheduled`.
struct DrainGuard {
    armed: bool,
}

impl DrainGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Pending drain dropped before running, releasing schedule");
            pending_registry().drain_scheduled = false;
        }
    }
}

fn register_pending(inner: &Arc<ContainerInner>) {
    let handle = tokio::runtime::Handle::try_current().ok();
    {
        let mut pending = pending_registry();
        pending.entries.retain(|weak| weak.strong_count() > 0);
        let target = Arc::as_ptr(inner);
        if !pending.entries.iter().any(|weak| std::ptr::eq(weak.as_ptr(), target)) {
            pending.entries.push(Arc::downgrade(inner));
        }
        if pending.drain_scheduled || handle.is_none() {
            return;
        }
        pending.drain_scheduled = true;
    }

    // Spawned outside the registry lock: a runtime that is shutting down
    // drops the future, and with it the guard, right away.
    if let Some(handle) = handle {
        let mut guard = DrainGuard { armed: true };
        handle.spawn(async move {
            guard.disarm();
            flush_pending();
        });
    }
}

/// Synchronously flushes every registered container with pending changes.
///
/// Returns the number of containers that delivered notifications.
pub fn flush_pending() -> usize {
    let ready = {
        let mut pending = pending_registry();
        pending.drain_scheduled = false;
        std::mem::take(&mut pending.entries)
    };

    ready
        .into_iter()
        .filter_map(|weak| weak.upgrade())
        .filter(|inner| StateContainer { inner: Arc::clone(inner) }.flush())
        .count()
}
