//! Test utilities shared across the crate.
//!
//! This module is only compiled during tests (`#[cfg(test)]`).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::core::error::BoxError;
use crate::core::feature::{Cancels, Feature, RequestConfig, RequestContext, state_map};

type Listener = Arc<dyn Fn() + Send + Sync>;

/// A fake media element: a few properties plus an event-listener list that
/// counts registrations, so tests can check for leaked listeners.
pub struct MockMedia {
    volume: Mutex<f64>,
    muted: Mutex<bool>,
    paused: Mutex<bool>,
    ready: AtomicBool,
    listeners: Mutex<Vec<(u64, String, Listener)>>,
    next_listener: AtomicU64,
    pub added: AtomicUsize,
    pub removed: AtomicUsize,
}

impl MockMedia {
    pub fn new(volume: f64, muted: bool) -> Self {
        Self {
            volume: Mutex::new(volume),
            muted: Mutex::new(muted),
            paused: Mutex::new(true),
            ready: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        }
    }

    pub fn volume(&self) -> f64 {
        *self.volume.lock().unwrap()
    }

    pub fn muted(&self) -> bool {
        *self.muted.lock().unwrap()
    }

    pub fn paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_volume(&self, volume: f64) {
        *self.volume.lock().unwrap() = volume;
        self.emit("volumechange");
    }

    pub fn set_muted(&self, muted: bool) {
        *self.muted.lock().unwrap() = muted;
        self.emit("volumechange");
    }

    pub fn set_paused(&self, paused: bool) {
        *self.paused.lock().unwrap() = paused;
        self.emit(if paused { "pause" } else { "play" });
    }

    pub fn add_listener(&self, event: &str, listener: impl Fn() + Send + Sync + 'static) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap()
            .push((id, event.to_string(), Arc::new(listener)));
        self.added.fetch_add(1, Ordering::SeqCst);
        id
    }

    pub fn remove_listener(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        if listeners.len() < before {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn emit(&self, event: &str) {
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e, _)| e == event)
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in matching {
            listener();
        }
    }
}

/// Registers `event` on the target and removes it when the attach cycle ends.
fn listen(ctx: &crate::core::feature::SubscribeContext<MockMedia>, events: &[&str]) {
    for event in events {
        let update = ctx.update.clone();
        let target = Arc::clone(&ctx.target);
        let id = target.add_listener(event, move || update.update());
        ctx.signal.on_abort(move || target.remove_listener(id));
    }
}

pub fn volume_feature() -> Arc<Feature<MockMedia>> {
    Feature::<MockMedia>::builder("volume")
        .initial_state(json!({ "volume": 1.0 }))
        .get_snapshot(|media: &MockMedia| state_map(json!({ "volume": media.volume() })))
        .subscribe(|ctx| listen(&ctx, &["volumechange"]))
        .request("setVolume", |input: Value, ctx: RequestContext<MockMedia>| async move {
            let volume = input.as_f64().ok_or("volume must be a number")?;
            tokio::task::yield_now().await;
            ctx.target().set_volume(volume);
            Ok::<Value, BoxError>(json!(volume))
        })
        .build()
}

pub fn muted_feature() -> Arc<Feature<MockMedia>> {
    Feature::<MockMedia>::builder("muted")
        .initial_state(json!({ "muted": false }))
        .get_snapshot(|media: &MockMedia| state_map(json!({ "muted": media.muted() })))
        .subscribe(|ctx| listen(&ctx, &["volumechange"]))
        .request("toggleMuted", |_input: Value, ctx: RequestContext<MockMedia>| async move {
            let muted = !ctx.target().muted();
            ctx.target().set_muted(muted);
            Ok::<Value, BoxError>(json!(muted))
        })
        .build()
}

pub fn playback_feature() -> Arc<Feature<MockMedia>> {
    Feature::<MockMedia>::builder("playback")
        .initial_state(json!({ "paused": true }))
        .get_snapshot(|media: &MockMedia| state_map(json!({ "paused": media.paused() })))
        .subscribe(|ctx| listen(&ctx, &["play", "pause"]))
        .request_with(
            "play",
            RequestConfig::new(|_input: Value, ctx: RequestContext<MockMedia>| async move {
                ctx.target().set_paused(false);
                Ok::<Value, BoxError>(Value::Bool(true))
            })
            .guard(|g| g.target.is_ready()),
        )
        .request_with(
            "pause",
            RequestConfig::new(|_input: Value, ctx: RequestContext<MockMedia>| async move {
                ctx.target().set_paused(true);
                Ok::<Value, BoxError>(Value::Bool(true))
            })
            .cancels(Cancels::Keys(vec!["play".to_string()])),
        )
        .build()
}

/// Shared media in the default test state.
pub fn test_media() -> Arc<MockMedia> {
    Arc::new(MockMedia::new(1.0, false))
}
