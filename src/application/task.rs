//! # Cancellable Tasks
//!
//! A `CancellableTask` runs one command handler on the runtime and exposes
//! its lifecycle: a monotonic status, an idempotent joinable outcome,
//! exactly-once completion callbacks and a cooperative cancellation token.
//!
//! Cancellation is cooperative by contract: the token is threaded into the
//! handler through its context and must be checked at safe points (loop
//! heads, around blocking calls). The task runner additionally races the
//! handler future against the token, so every await point doubles as a safe
//! point. Forced termination of a running handler is never performed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Notify, watch};

use crate::domain::error::BotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("invalid task state: {0}")]
    InvalidState(&'static str),

    #[error("timed out waiting for task")]
    JoinTimeout,

    #[error("command cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Failed(Arc<BotError>),
}

pub type TaskOutcome<T> = Result<T, TaskError>;

/// Shared cooperative-cancellation flag. Cloning is cheap; all clones
/// observe the same trigger.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Handler-side safe point: returns the cancellation error once the
    /// token has been triggered.
    pub fn checkpoint(&self) -> Result<(), BotError> {
        if self.is_cancelled() {
            Err(BotError::cancelled("cancellation requested"))
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is triggered.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

enum CallbackState<T> {
    Pending(Vec<Box<dyn FnOnce(&TaskOutcome<T>) + Send>>),
    Fired,
}

struct TaskShared<T> {
    status: watch::Sender<TaskStatus>,
    // Keeps the watch channel open so status sends are never dropped.
    _status_rx: watch::Receiver<TaskStatus>,
    outcome: Mutex<Option<TaskOutcome<T>>>,
    callbacks: Mutex<CallbackState<T>>,
    token: CancelToken,
}

impl<T: Clone + Send + Sync + 'static> TaskShared<T> {
    fn current_status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Records the outcome, publishes the terminal status and fires the
    /// callbacks. Called exactly once per task.
    fn finish(&self, result: TaskOutcome<T>) {
        let terminal = match &result {
            Ok(_) => TaskStatus::Completed,
            Err(TaskError::Cancelled(_)) => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        };
        {
            let mut slot = self.outcome.lock().expect("task outcome poisoned");
            if slot.is_some() {
                return;
            }
            *slot = Some(result.clone());
        }
        // Outcome must be visible before waiters observe the terminal status.
        let _ = self.status.send(terminal);

        let pending = {
            let mut callbacks = self.callbacks.lock().expect("task callbacks poisoned");
            match std::mem::replace(&mut *callbacks, CallbackState::Fired) {
                CallbackState::Pending(list) => list,
                CallbackState::Fired => Vec::new(),
            }
        };
        for cb in pending {
            // Notification must never destabilize the task it describes.
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| cb(&result)));
        }
    }

    async fn wait_terminal(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.status.subscribe();
        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}

/// Type-erased view of a running task, stored on the owning session so a
/// concurrent cancel request can find it.
#[async_trait]
pub trait RunningTask: Send + Sync {
    fn status(&self) -> TaskStatus;
    /// Fire-and-forget cancellation. Safe to call from the worker itself.
    fn signal_cancel(&self);
    /// Waits for the task to reach a terminal state. Returns false on
    /// timeout.
    async fn wait_terminal(&self, timeout: Option<Duration>) -> bool;
}

struct SharedHandle<T>(Arc<TaskShared<T>>);

#[async_trait]
impl<T: Clone + Send + Sync + 'static> RunningTask for SharedHandle<T> {
    fn status(&self) -> TaskStatus {
        self.0.current_status()
    }

    fn signal_cancel(&self) {
        let _ = self.0.status.send_if_modified(|s| {
            if *s == TaskStatus::Running {
                *s = TaskStatus::Cancelling;
                true
            } else {
                false
            }
        });
        self.0.token.trigger();
    }

    async fn wait_terminal(&self, timeout: Option<Duration>) -> bool {
        self.0.wait_terminal(timeout).await
    }
}

/// One unit of handler execution with cooperative cancellation.
pub struct CancellableTask<T> {
    shared: Arc<TaskShared<T>>,
    fut: Mutex<Option<BoxFuture<'static, Result<T, BotError>>>>,
}

impl<T: Clone + Send + Sync + 'static> CancellableTask<T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = Result<T, BotError>> + Send + 'static,
    {
        Self::with_token(CancelToken::new(), fut)
    }

    /// Builds a task around an externally created token, so the same token
    /// can be handed to the handler's context before the task starts.
    pub fn with_token<F>(token: CancelToken, fut: F) -> Self
    where
        F: std::future::Future<Output = Result<T, BotError>> + Send + 'static,
    {
        let (status, status_rx) = watch::channel(TaskStatus::Idle);
        Self {
            shared: Arc::new(TaskShared {
                status,
                _status_rx: status_rx,
                outcome: Mutex::new(None),
                callbacks: Mutex::new(CallbackState::Pending(Vec::new())),
                token,
            }),
            fut: Mutex::new(Some(fut.boxed())),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.current_status()
    }

    pub fn token(&self) -> CancelToken {
        self.shared.token.clone()
    }

    /// A type-erased handle suitable for storing on a session.
    pub fn handle(&self) -> Arc<dyn RunningTask> {
        Arc::new(SharedHandle(self.shared.clone()))
    }

    /// Idle → Running: spawns the bound future onto the runtime.
    pub fn start(&self) -> Result<(), TaskError> {
        let fut = {
            let mut slot = self.fut.lock().expect("task future poisoned");
            if self.status() != TaskStatus::Idle {
                return Err(TaskError::InvalidState("task is not idle"));
            }
            slot.take()
                .ok_or(TaskError::InvalidState("task already started"))?
        };
        let _ = self.shared.status.send(TaskStatus::Running);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let token = shared.token.clone();
            let result = tokio::select! {
                _ = token.cancelled() => {
                    Err(TaskError::Cancelled("cancellation requested".to_string()))
                }
                res = AssertUnwindSafe(fut).catch_unwind() => match res {
                    _ if shared.token.is_cancelled() => {
                        Err(TaskError::Cancelled("cancellation requested".to_string()))
                    }
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(BotError::Cancelled(msg))) => Err(TaskError::Cancelled(msg)),
                    Ok(Err(err)) => Err(TaskError::Failed(Arc::new(err))),
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "handler panicked".to_string());
                        Err(TaskError::Failed(Arc::new(BotError::Other(
                            anyhow::anyhow!("handler panicked: {msg}"),
                        ))))
                    }
                },
            };
            shared.finish(result);
        });
        Ok(())
    }

    /// Running → Cancelling, then waits (bounded by `timeout`, unbounded
    /// when `None`) for the worker to exit. Terminal states are a no-op;
    /// an Idle task cannot be cancelled.
    pub async fn request_cancel(&self, timeout: Option<Duration>) -> Result<(), TaskError> {
        let status = self.status();
        if status == TaskStatus::Idle {
            return Err(TaskError::InvalidState("cannot cancel a task that has not started"));
        }
        if status.is_terminal() {
            return Ok(());
        }
        let _ = self.shared.status.send_if_modified(|s| {
            if *s == TaskStatus::Running {
                *s = TaskStatus::Cancelling;
                true
            } else {
                false
            }
        });
        self.shared.token.trigger();
        if self.shared.wait_terminal(timeout).await {
            Ok(())
        } else {
            Err(TaskError::JoinTimeout)
        }
    }

    /// Fire-and-forget cancellation, for use from inside the running
    /// handler itself (no self-join).
    pub fn signal_cancel(&self) {
        SharedHandle(self.shared.clone()).signal_cancel();
    }

    /// Blocks until terminal (or `timeout`), then returns a clone of the
    /// recorded outcome. Reads after the first are idempotent.
    pub async fn join(&self, timeout: Option<Duration>) -> TaskOutcome<T> {
        if !self.shared.wait_terminal(timeout).await {
            return Err(TaskError::JoinTimeout);
        }
        self.shared
            .outcome
            .lock()
            .expect("task outcome poisoned")
            .clone()
            .expect("terminal task has an outcome")
    }

    /// Registers a callback invoked exactly once with the terminal outcome.
    /// Registration after the terminal transition fires immediately.
    pub fn on_complete<F>(&self, cb: F)
    where
        F: FnOnce(&TaskOutcome<T>) + Send + 'static,
    {
        let fire_now = {
            let mut callbacks = self.shared.callbacks.lock().expect("task callbacks poisoned");
            match &mut *callbacks {
                CallbackState::Pending(list) => {
                    list.push(Box::new(cb));
                    None
                }
                CallbackState::Fired => Some((
                    cb,
                    self.shared
                        .outcome
                        .lock()
                        .expect("task outcome poisoned")
                        .clone()
                        .expect("fired task has an outcome"),
                )),
            }
        };
        if let Some((cb, outcome)) = fire_now {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| cb(&outcome)));
        }
    }
}
