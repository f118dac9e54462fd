//! # Task Groups
//!
//! Runs a batch of `CancellableTask`s and aggregates their outcomes. Group
//! completion is driven purely by terminal-state observation: each member
//! reports through its completion callback, and the group flips to a
//! terminal status when the last member does, regardless of what values the
//! members produced.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::application::task::{CancellableTask, TaskError, TaskOutcome, TaskStatus};
use crate::domain::error::BotError;

struct GroupShared<T> {
    remaining: AtomicUsize,
    /// Member outcomes in arrival order, not submission order.
    results: Mutex<Vec<TaskOutcome<T>>>,
    status: watch::Sender<TaskStatus>,
    // Keeps the watch channel open so status sends are never dropped.
    _status_rx: watch::Receiver<TaskStatus>,
    cancel_requested: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> GroupShared<T> {
    /// Completion callback body for one member. The last arrival derives
    /// the aggregate status and fires the group's terminal transition,
    /// exactly once.
    fn member_done(&self, outcome: &TaskOutcome<T>) {
        self.results
            .lock()
            .expect("group results poisoned")
            .push(outcome.clone());
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        // Cancelled is reserved for an explicit group cancel; a member that
        // ends Cancelled on its own counts as a failure like any other.
        let aggregate = {
            let results = self.results.lock().expect("group results poisoned");
            if self.cancel_requested.load(Ordering::SeqCst) {
                TaskStatus::Cancelled
            } else if results.iter().any(|r| r.is_err()) {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            }
        };
        let _ = self.status.send(aggregate);
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

/// A batch of tasks started together and joined as one unit.
pub struct TaskGroup<T> {
    tasks: Vec<CancellableTask<T>>,
    shared: Arc<GroupShared<T>>,
}

impl<T: Clone + Send + Sync + 'static> TaskGroup<T> {
    pub fn from_tasks(tasks: Vec<CancellableTask<T>>) -> Self {
        let (status, status_rx) = watch::channel(TaskStatus::Idle);
        let shared = Arc::new(GroupShared {
            remaining: AtomicUsize::new(tasks.len()),
            results: Mutex::new(Vec::with_capacity(tasks.len())),
            status,
            _status_rx: status_rx,
            cancel_requested: AtomicBool::new(false),
        });
        Self { tasks, shared }
    }

    /// One member per input item, each running `f(item)`.
    pub fn from_fn<I, F, Fut>(items: impl IntoIterator<Item = I>, f: F) -> Self
    where
        F: Fn(I) -> Fut,
        Fut: std::future::Future<Output = Result<T, BotError>> + Send + 'static,
    {
        Self::from_tasks(items.into_iter().map(|item| CancellableTask::new(f(item))).collect())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn status(&self) -> TaskStatus {
        *self.shared.status.borrow()
    }

    /// Registers the aggregation callbacks, then starts every member.
    pub fn start(&self) -> Result<(), TaskError> {
        if self.is_empty() {
            return Err(TaskError::InvalidState("group has no tasks"));
        }
        if self.status() != TaskStatus::Idle {
            return Err(TaskError::InvalidState("group is not idle"));
        }
        let _ = self.shared.status.send(TaskStatus::Running);

        for task in &self.tasks {
            let shared = self.shared.clone();
            task.on_complete(move |outcome| shared.member_done(outcome));
        }
        for task in &self.tasks {
            task.start()?;
        }
        Ok(())
    }

    /// Signals every non-terminal member, then waits for the whole group
    /// to settle.
    pub async fn request_cancel(&self, timeout: Option<Duration>) -> Result<(), TaskError> {
        let status = self.status();
        if status == TaskStatus::Idle {
            return Err(TaskError::InvalidState("cannot cancel a group that has not started"));
        }
        if status.is_terminal() {
            return Ok(());
        }
        self.shared.cancel_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.status.send_if_modified(|s| {
            if *s == TaskStatus::Running {
                *s = TaskStatus::Cancelling;
                true
            } else {
                false
            }
        });
        for task in &self.tasks {
            if !task.status().is_terminal() {
                task.signal_cancel();
            }
        }
        if self.shared.wait_terminal(timeout).await {
            Ok(())
        } else {
            Err(TaskError::JoinTimeout)
        }
    }

    /// Blocks until the group settles, then returns the member outcomes in
    /// arrival order.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<Vec<TaskOutcome<T>>, TaskError> {
        if !self.shared.wait_terminal(timeout).await {
            return Err(TaskError::JoinTimeout);
        }
        Ok(self.results())
    }

    /// Snapshot of the outcomes collected so far, in arrival order.
    pub fn results(&self) -> Vec<TaskOutcome<T>> {
        self.shared
            .results
            .lock()
            .expect("group results poisoned")
            .clone()
    }
}
