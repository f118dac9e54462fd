//! # Interruptible Requests
//!
//! Wraps one outbound HTTP call so that an external `stop()` terminates it
//! within a short bounded time, even while the call is blocked on the
//! network. The worker drives the request on its own spawned task (whose
//! join handle is the natively owned cancellation point) and polls, on a
//! short interval, both request completion and a private wake primitive
//! owned by the operation. `stop()` signals the wake primitive; the worker
//! observes it on its next poll, so cancellation latency is bounded by the
//! poll interval rather than by the request timeout.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{Notify, watch};

use crate::application::session::{InterruptPoint, Session};
use crate::domain::error::BotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Initialized,
    Running,
    Completed,
    Interrupted,
    Failed,
}

struct RequestShared {
    status: Mutex<RequestStatus>,
    outcome: Mutex<Option<Result<reqwest::Response, BotError>>>,
    /// Out-of-band wake primitive, signalled at most once.
    wake: Notify,
    interrupted_once: AtomicBool,
    done: watch::Sender<bool>,
    // Keeps the watch channel open so done sends are never dropped.
    _done_rx: watch::Receiver<bool>,
}

impl RequestShared {
    fn current_status(&self) -> RequestStatus {
        *self.status.lock().expect("request status poisoned")
    }

    /// Records the worker-side outcome; ignored when `stop()` already
    /// classified the operation as Interrupted.
    fn complete(&self, result: Result<Result<reqwest::Response, reqwest::Error>, tokio::task::JoinError>) {
        {
            let mut status = self.status.lock().expect("request status poisoned");
            if *status != RequestStatus::Running {
                return;
            }
            match result {
                Ok(Ok(response)) => {
                    // The response is recorded before the status flips.
                    *self.outcome.lock().expect("request outcome poisoned") = Some(Ok(response));
                    *status = RequestStatus::Completed;
                }
                Ok(Err(err)) => {
                    *self.outcome.lock().expect("request outcome poisoned") =
                        Some(Err(BotError::Other(anyhow!("request failed: {err}"))));
                    *status = RequestStatus::Failed;
                }
                Err(join_err) if join_err.is_cancelled() => {
                    *self.outcome.lock().expect("request outcome poisoned") =
                        Some(Err(BotError::cancelled("request aborted")));
                    *status = RequestStatus::Interrupted;
                }
                Err(join_err) => {
                    *self.outcome.lock().expect("request outcome poisoned") =
                        Some(Err(BotError::Other(anyhow!("request worker failed: {join_err}"))));
                    *status = RequestStatus::Failed;
                }
            }
        }
        let _ = self.done.send(true);
    }

    /// Signals the wake primitive and pre-records the interruption error.
    /// Idempotent; the wake primitive is signalled at most once and never
    /// after a normal completion overwrote the outcome.
    fn mark_interrupted(&self) -> bool {
        if self.interrupted_once.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut status = self.status.lock().expect("request status poisoned");
            if matches!(*status, RequestStatus::Completed | RequestStatus::Failed) {
                return false;
            }
            *status = RequestStatus::Interrupted;
            let mut outcome = self.outcome.lock().expect("request outcome poisoned");
            if outcome.is_none() {
                *outcome = Some(Err(BotError::cancelled("request interrupted")));
            }
        }
        self.wake.notify_one();
        true
    }
}

impl InterruptPoint for RequestShared {
    fn interrupt(&self) {
        if self.mark_interrupted() {
            let _ = self.done.send(true);
        }
    }
}

/// One HTTP call that can be aborted mid-flight.
pub struct InterruptibleRequest {
    shared: Arc<RequestShared>,
    poll_interval: Duration,
}

impl InterruptibleRequest {
    pub fn new(poll_interval: Duration) -> Self {
        let (done, done_rx) = watch::channel(false);
        Self {
            shared: Arc::new(RequestShared {
                status: Mutex::new(RequestStatus::Initialized),
                outcome: Mutex::new(None),
                wake: Notify::new(),
                interrupted_once: AtomicBool::new(false),
                done,
                _done_rx: done_rx,
            }),
            poll_interval,
        }
    }

    /// Builds the operation and registers it as the session's interrupt
    /// point, so a session-level cancel can abort the blocked call.
    pub fn bound(session: &Session, poll_interval: Duration) -> Self {
        let op = Self::new(poll_interval);
        session.set_interrupt_point(op.shared.clone());
        op
    }

    pub fn status(&self) -> RequestStatus {
        self.shared.current_status()
    }

    /// Initialized → Running: spawns the worker driving the request.
    pub fn start(&self, builder: reqwest::RequestBuilder) -> Result<(), BotError> {
        {
            let mut status = self.shared.status.lock().expect("request status poisoned");
            if *status != RequestStatus::Initialized {
                return Err(BotError::Other(anyhow!("request already started")));
            }
            *status = RequestStatus::Running;
        }

        let shared = self.shared.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut call = tokio::spawn(async move { builder.send().await });
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shared.wake.notified() => {
                        // stop() already set the status; leave the outcome
                        // slot untouched and release the in-flight call.
                        call.abort();
                        break;
                    }
                    result = &mut call => {
                        shared.complete(result);
                        return;
                    }
                    _ = ticker.tick() => {
                        // Re-validate liveness each poll; covers a wake that
                        // fired before this worker subscribed.
                        if shared.current_status() != RequestStatus::Running {
                            call.abort();
                            break;
                        }
                    }
                }
            }
            let _ = shared.done.send(true);
        });
        Ok(())
    }

    /// Interrupts the call. No-op once the operation completed or failed;
    /// idempotent and safe to call from any concurrent context. Waits
    /// briefly for the worker to exit.
    pub async fn stop(&self) {
        if self.shared.mark_interrupted() {
            let mut done = self.shared.done.subscribe();
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while !*done.borrow_and_update() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            let _ = self.shared.done.send(true);
        }
    }

    /// Blocks on the completion signal and hands out the response (or the
    /// captured error). The response can be consumed once.
    pub async fn get_result(&self, timeout: Option<Duration>) -> Result<reqwest::Response, BotError> {
        let mut done = self.shared.done.subscribe();
        let wait = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    return Err(BotError::Other(anyhow!("timed out waiting for request result")));
                }
            }
            None => wait.await,
        }

        match self.shared.outcome.lock().expect("request outcome poisoned").take() {
            Some(result) => result,
            None => Err(BotError::Other(anyhow!("request result already consumed"))),
        }
    }

    /// start + get_result convenience for handlers.
    pub async fn run(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, BotError> {
        self.start(builder)?;
        self.get_result(timeout).await
    }
}

impl Drop for InterruptibleRequest {
    fn drop(&mut self) {
        // A dropped handler future must not leak a blocked worker.
        if self.shared.current_status() == RequestStatus::Running {
            self.shared.mark_interrupted();
        }
    }
}
