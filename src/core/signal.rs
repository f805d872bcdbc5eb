//! # Abort Signals
//!
//! Cooperative cancellation shared by the task queue and the attach cycle.
//!
//! An [`AbortController`] owns the right to cancel; every [`AbortSignal`]
//! cloned from it observes the same flag. Nothing is ever force-terminated:
//! a handler notices cancellation at its own await points, either by polling
//! [`AbortSignal::is_aborted`] or by racing [`AbortSignal::aborted`].
//!
//! ```text
//! AbortController ──abort()──► flag = true
//!        │                       ├─► on_abort callbacks (sync, once)
//!        └─ signal() ──clone──►  └─► aborted().await wakes
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

type AbortCallback = Box<dyn FnOnce() + Send>;

struct SignalInner {
    aborted: AtomicBool,
    callbacks: Mutex<Vec<AbortCallback>>,
    notify: Notify,
}

/// Owning side of a cancellation scope.
pub struct AbortController {
    inner: Arc<SignalInner>,
}

/// Read side of a cancellation scope. Cheap to clone.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                aborted: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Marks the scope aborted, runs registered callbacks, and wakes waiters.
    ///
    /// Returns `false` if the scope was already aborted (callbacks only run once).
    pub fn abort(&self) -> bool {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callbacks = match self.inner.callbacks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        // Callbacks run without the lock held so they may touch the signal again.
        for callback in callbacks {
            callback();
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the owning controller aborts. Resolves immediately if it already has.
    pub async fn aborted(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // abort between the check and the await is not missed.
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Registers a teardown callback. Runs immediately if already aborted.
    pub fn on_abort(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_aborted() {
            callback();
            return;
        }
        let mut guard = match self.inner.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock: abort() may have drained the list meanwhile.
        if self.is_aborted() {
            drop(guard);
            callback();
            return;
        }
        guard.push(Box::new(callback));
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
