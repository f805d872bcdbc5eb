//! # Task Queue
//!
//! Runs named async units of work on the ambient tokio runtime.
//!
//! ```text
//! enqueue(spec) ──► record {id, key, mode, started_at, meta, controller}
//!                     │
//!   Exclusive ────────┤ abort every active record with the same key first
//!   Concurrent ───────┘ run alongside same-key records
//!                     │
//!                     ▼
//!   spawned task: [aborted?] → schedule → [aborted?] → body → on_settle → caller
//! ```
//!
//! Cancellation is cooperative. If the signal fires before the body starts
//! the body never runs. If it fires while the body runs, the caller's
//! [`TaskHandle`] settles with [`TaskError::Cancelled`] at once and the body
//! keeps being driven in the background until it returns on its own.
//!
//! The queue knows nothing about stores; records are looked up by key only.

use log::{debug, warn};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::{BoxError, SharedError};
use super::meta::RequestMeta;
use super::signal::{AbortController, AbortSignal};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TaskMode {
    /// Enqueuing cancels any active record with the same key.
    #[serde(rename = "exclusive")]
    #[default]
    Exclusive,
    /// Same-key records run independently.
    #[serde(rename = "concurrent")]
    Concurrent,
}

/// How a task failed to produce a value.
#[derive(Debug, Clone)]
pub enum TaskError {
    Cancelled { key: String },
    Failed { key: String, source: SharedError },
}

impl TaskError {
    pub fn key(&self) -> &str {
        match self {
            TaskError::Cancelled { key } | TaskError::Failed { key, .. } => key,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Cancelled { key } => write!(f, "task `{key}` cancelled"),
            TaskError::Failed { key, source } => write!(f, "task `{key}` failed: {source}"),
        }
    }
}

impl std::error::Error for TaskError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `destroy()` was called; the queue accepts no more work.
    Destroyed,
    /// `enqueue` was called outside a tokio runtime.
    NoRuntime,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Destroyed => write!(f, "task queue destroyed"),
            QueueError::NoRuntime => write!(f, "no tokio runtime to run tasks on"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Awaited before a task body starts; used to delay or debounce.
pub type ScheduleFn = Arc<dyn Fn(AbortSignal) -> BoxFuture<'static, ()> + Send + Sync>;

type TaskBody<T> = Box<dyn FnOnce(AbortSignal) -> BoxFuture<'static, Result<T, BoxError>> + Send>;
type SettleFn<T> = Box<dyn FnOnce(&Result<T, TaskError>) + Send>;

/// One unit of work to enqueue.
pub struct TaskSpec<T> {
    key: String,
    mode: TaskMode,
    meta: Option<RequestMeta>,
    schedule: Option<ScheduleFn>,
    body: TaskBody<T>,
    on_settle: Option<SettleFn<T>>,
}

impl<T: Send + 'static> TaskSpec<T> {
    pub fn new<F, Fut>(key: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            mode: TaskMode::default(),
            meta: None,
            schedule: None,
            body: Box::new(move |signal| Box::pin(body(signal))),
            on_settle: None,
        }
    }

    pub fn mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    /// Recorded on the task for the pending readout.
    pub fn meta(mut self, meta: Option<RequestMeta>) -> Self {
        self.meta = meta;
        self
    }

    pub fn schedule(mut self, schedule: Option<ScheduleFn>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Runs inside the task after the outcome is known and before the
    /// caller's handle resolves.
    pub fn on_settle(mut self, callback: impl FnOnce(&Result<T, TaskError>) + Send + 'static) -> Self {
        self.on_settle = Some(Box::new(callback));
        self
    }
}

/// Read-only view of an active task record.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: Uuid,
    pub key: String,
    pub mode: TaskMode,
    pub started_at: Instant,
    pub meta: Option<RequestMeta>,
}

struct TaskRecord {
    info: TaskInfo,
    controller: AbortController,
}

#[derive(Default)]
struct QueueState {
    records: Vec<TaskRecord>,
    destroyed: bool,
}

#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Task queue lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Registers and spawns a task on the current tokio runtime.
    ///
    /// Without a runtime nothing is registered or aborted and
    /// [`QueueError::NoRuntime`] is returned.
    pub fn enqueue<T: Send + 'static>(&self, spec: TaskSpec<T>) -> Result<TaskHandle<T>, QueueError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let TaskSpec {
            key,
            mode,
            meta,
            schedule,
            body,
            on_settle,
        } = spec;

        let controller = AbortController::new();
        let signal = controller.signal();
        let id = Uuid::new_v4();

        let superseded = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(QueueError::Destroyed);
            }
            let superseded = match mode {
                TaskMode::Exclusive => take_matching(&mut state.records, |r| r.info.key == key),
                TaskMode::Concurrent => Vec::new(),
            };
            state.records.push(TaskRecord {
                info: TaskInfo {
                    id,
                    key: key.clone(),
                    mode,
                    started_at: Instant::now(),
                    meta,
                },
                controller,
            });
            superseded
        };

        for record in superseded {
            debug!("Task `{}` ({}) superseded by {}", record.info.key, record.info.id, id);
            record.controller.abort();
        }

        debug!("Enqueued task `{}` ({}, {:?})", key, id, mode);
        let (tx, rx) = oneshot::channel();
        let queue = self.clone();
        let task_key = key.clone();
        runtime.spawn(async move {
            let outcome = drive(&task_key, &signal, schedule, body).await;
            queue.remove(id);
            if let Some(callback) = on_settle {
                callback(&outcome);
            }
            // The caller may have dropped its handle; that is fine.
            let _ = tx.send(outcome);
        });

        Ok(TaskHandle { key, rx })
    }

    /// Aborts every active record under `key`. Returns how many were aborted.
    pub fn abort(&self, key: &str) -> usize {
        let aborted = take_matching(&mut self.lock().records, |r| r.info.key == key);
        abort_records(aborted)
    }

    /// Aborts every active record.
    pub fn abort_all(&self) -> usize {
        let aborted = std::mem::take(&mut self.lock().records);
        abort_records(aborted)
    }

    /// Aborts everything; later `enqueue` calls fail with [`QueueError::Destroyed`].
    pub fn destroy(&self) {
        let aborted = {
            let mut state = self.lock();
            state.destroyed = true;
            std::mem::take(&mut state.records)
        };
        let count = abort_records(aborted);
        debug!("Task queue destroyed ({} task(s) aborted)", count);
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Active records in enqueue order.
    pub fn active(&self) -> Vec<TaskInfo> {
        self.lock().records.iter().map(|r| r.info.clone()).collect()
    }

    fn remove(&self, id: Uuid) {
        self.lock().records.retain(|r| r.info.id != id);
    }
}

fn take_matching(records: &mut Vec<TaskRecord>, matches: impl Fn(&TaskRecord) -> bool) -> Vec<TaskRecord> {
    let (taken, kept) = std::mem::take(records).into_iter().partition(|r| matches(r));
    *records = kept;
    taken
}

fn abort_records(records: Vec<TaskRecord>) -> usize {
    // Called without the queue lock: abort callbacks may re-enter the queue.
    let count = records.len();
    for record in records {
        debug!("Aborting task `{}` ({})", record.info.key, record.info.id);
        record.controller.abort();
    }
    count
}

async fn drive<T: Send + 'static>(
    key: &str,
    signal: &AbortSignal,
    schedule: Option<ScheduleFn>,
    body: TaskBody<T>,
) -> Result<T, TaskError> {
    let cancelled = || TaskError::Cancelled { key: key.to_string() };

    if signal.is_aborted() {
        return Err(cancelled());
    }
    if let Some(schedule) = schedule {
        tokio::select! {
            biased;
            _ = signal.aborted() => return Err(cancelled()),
            _ = schedule(signal.clone()) => {}
        }
        if signal.is_aborted() {
            return Err(cancelled());
        }
    }

    let mut running = body(signal.clone());
    let finished = tokio::select! {
        biased;
        result = &mut running => Some(result),
        _ = signal.aborted() => None,
    };

    match finished {
        Some(result) => result.map_err(|source| TaskError::Failed {
            key: key.to_string(),
            source: SharedError::from(source),
        }),
        None => {
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = running.await {
                    debug!("Cancelled task `{}` finished with error: {}", key, e);
                }
            });
            Err(cancelled())
        }
    }
}

/// Resolves with the task's outcome.
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<T> {
    key: String,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Failed {
                key: self.key.clone(),
                source: SharedError::from(BoxError::from("task ended without settling")),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
