//! # Sessions
//!
//! One `Session` per peer user, created lazily and reaped after sustained
//! idleness. A session serializes command execution for its peer through a
//! single execution lock, carries the input pipe that feeds multi-turn
//! prompts, and holds the handles a concurrent cancel request needs: the
//! running task and the current interrupt point.
//!
//! The registry lock inside `SessionManager` only guards the peer map and is
//! never held across an await; the per-session execution lock is a separate
//! object held for the whole duration of a command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::task::RunningTask;
use crate::domain::config::AppConfig;
use crate::domain::error::BotError;
use crate::domain::message::{tokenize, Message, MessagePart, PartKind, Target};
use crate::domain::traits::Gateway;
use crate::strings::messages;

/// Something a session-level cancel can abort out-of-band, typically a
/// blocked network call. `interrupt` must be cheap and non-blocking.
pub trait InterruptPoint: Send + Sync {
    fn interrupt(&self);
}

/// Result of trying to cancel the command currently running on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCurrent {
    NotRunning,
    NotCancelable,
    Done,
    TimedOut,
}

pub struct Session {
    peer: u64,
    config: Arc<AppConfig>,
    gateway: Arc<dyn Gateway>,
    /// Execution lock. Held (as an owned guard) for the whole lifetime of a
    /// command; `try_lock` doubles as the busy probe.
    lock: Arc<tokio::sync::Mutex<()>>,
    pipe_tx: mpsc::Sender<Message>,
    pipe_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    /// True while the running command waits on the pipe.
    getting: AtomicBool,
    /// Conversation the current prompt was issued in; inbound messages from
    /// other conversations are redirected rather than consumed.
    interaction_target: Mutex<Option<Target>>,
    /// Nesting depth of prompt scopes. The deadline is set when the
    /// outermost scope opens and spans the whole interaction.
    prompt_depth: AtomicUsize,
    prompt_deadline: Mutex<Option<Instant>>,
    running: Mutex<Option<(Arc<dyn RunningTask>, bool)>>,
    interrupt_point: Mutex<Option<Arc<dyn InterruptPoint>>>,
}

impl Session {
    pub fn new(peer: u64, config: Arc<AppConfig>, gateway: Arc<dyn Gateway>) -> Self {
        let (pipe_tx, pipe_rx) = mpsc::channel(config.session.pipe_capacity);
        Self {
            peer,
            config,
            gateway,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            pipe_tx,
            pipe_rx: tokio::sync::Mutex::new(pipe_rx),
            getting: AtomicBool::new(false),
            interaction_target: Mutex::new(None),
            prompt_depth: AtomicUsize::new(0),
            prompt_deadline: Mutex::new(None),
            running: Mutex::new(None),
            interrupt_point: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> u64 {
        self.peer
    }

    /// Claims the execution lock without waiting. `None` means a command is
    /// already in flight for this peer.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.lock.clone().try_lock_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn is_getting(&self) -> bool {
        self.getting.load(Ordering::SeqCst)
    }

    pub fn interaction_target(&self) -> Option<Target> {
        *self.interaction_target.lock().expect("interaction target poisoned")
    }

    /// Feeds an inbound message to the prompt currently waiting on this
    /// session. Dropped with a warning when the pipe is full.
    pub fn pipe_put(&self, msg: Message) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.pipe_tx.try_send(msg) {
            warn!(peer = self.peer, "session input pipe full, dropping message");
        }
    }

    pub fn set_running(&self, handle: Arc<dyn RunningTask>, cancelable: bool) {
        *self.running.lock().expect("running slot poisoned") = Some((handle, cancelable));
    }

    pub fn clear_running(&self) {
        *self.running.lock().expect("running slot poisoned") = None;
        *self.interrupt_point.lock().expect("interrupt point poisoned") = None;
    }

    pub fn running(&self) -> Option<(Arc<dyn RunningTask>, bool)> {
        self.running.lock().expect("running slot poisoned").clone()
    }

    /// Registers the operation a cancel request should abort out-of-band.
    /// Replaces any previous interrupt point.
    pub fn set_interrupt_point(&self, point: Arc<dyn InterruptPoint>) {
        *self.interrupt_point.lock().expect("interrupt point poisoned") = Some(point);
    }

    /// Cancels the command currently running on this session: signals its
    /// token, interrupts the registered operation, then waits (bounded by
    /// `timeout`) for the task to settle.
    pub async fn cancel_current(&self, timeout: Option<Duration>) -> CancelCurrent {
        let Some((handle, cancelable)) = self.running() else {
            return CancelCurrent::NotRunning;
        };
        if !cancelable {
            return CancelCurrent::NotCancelable;
        }
        handle.signal_cancel();
        if let Some(point) = self.interrupt_point.lock().expect("interrupt point poisoned").take() {
            point.interrupt();
        }
        if handle.wait_terminal(timeout).await {
            CancelCurrent::Done
        } else {
            CancelCurrent::TimedOut
        }
    }

    fn begin_prompt(&self, origin: Target, timeout: Option<Duration>) {
        if self.prompt_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            let deadline = Instant::now()
                + timeout
                    .unwrap_or(Duration::from_secs(self.config.session.input_timeout_secs));
            *self.prompt_deadline.lock().expect("prompt deadline poisoned") = Some(deadline);
            self.getting.store(true, Ordering::SeqCst);
        }
        *self.interaction_target.lock().expect("interaction target poisoned") = Some(origin);
    }

    fn end_prompt(&self) {
        if self.prompt_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.getting.store(false, Ordering::SeqCst);
            *self.prompt_deadline.lock().expect("prompt deadline poisoned") = None;
            *self.interaction_target.lock().expect("interaction target poisoned") = None;
        }
    }

    /// Clears any interaction state a dropped handler future left behind
    /// and drains stale pipe input. The router calls this after every
    /// command settles.
    pub fn reset_interaction(&self) {
        self.prompt_depth.store(0, Ordering::SeqCst);
        self.getting.store(false, Ordering::SeqCst);
        *self.prompt_deadline.lock().expect("prompt deadline poisoned") = None;
        *self.interaction_target.lock().expect("interaction target poisoned") = None;
        if let Ok(mut rx) = self.pipe_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// True when the message's first token, after prefix stripping, is the
    /// configured cancel keyword.
    pub fn is_cancel_message(&self, msg: &Message) -> bool {
        let Some(text) = msg.first_text() else { return false };
        let stripped = self.config.bot.strip_prefix(text).unwrap_or(text);
        tokenize(stripped)
            .first()
            .is_some_and(|t| t == &self.config.bot.cancel_keyword)
    }

    /// One pipe read against the current prompt deadline.
    async fn read_pipe(&self) -> Result<Message, BotError> {
        let deadline = self
            .prompt_deadline
            .lock()
            .expect("prompt deadline poisoned")
            .unwrap_or_else(|| {
                Instant::now() + Duration::from_secs(self.config.session.input_timeout_secs)
            });
        let mut rx = self.pipe_rx.lock().await;
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => Err(BotError::InputTimeout(self.config.session.input_timeout_secs)),
            Ok(None) => Err(BotError::Other(anyhow!("session input pipe closed"))),
            Ok(Some(msg)) => {
                if self.is_cancel_message(&msg) {
                    debug!(peer = self.peer, "prompt aborted by cancel keyword");
                    Err(BotError::cancelled("cancelled by user"))
                } else {
                    Ok(msg)
                }
            }
        }
    }

    /// Waits for the peer's next message. `timeout` overrides the configured
    /// input window; a nested call inherits the outer deadline instead.
    /// With `notify`, a "waiting for input" notice is posted for the
    /// duration of the wait and deleted on every exit path.
    pub async fn pipe_get(
        &self,
        origin: Target,
        timeout: Option<Duration>,
        notify: bool,
    ) -> Result<Message, BotError> {
        self.begin_prompt(origin, timeout);

        let notice = if notify {
            self.gateway
                .send_text(origin, &messages::waiting_for_input(&self.config.bot.cancel_keyword))
                .await
                .ok()
        } else {
            None
        };

        let result = self.read_pipe().await;

        if let Some(handle) = notice {
            let _ = self.gateway.delete_message(handle).await;
        }
        self.end_prompt();
        result
    }

    /// Collects exactly `count` parts of one kind. Seeds from the triggering
    /// message itself, then from the message it quotes, then prompts the
    /// peer for the shortfall until the deadline. Prompt messages are
    /// deleted whether or not the collection succeeds.
    pub async fn pipe_get_by_type(
        &self,
        origin: Target,
        seed: &Message,
        kind: PartKind,
        count: usize,
    ) -> Result<Vec<MessagePart>, BotError> {
        let mut collected = seed.parts_of(kind);
        if collected.len() < count {
            if let Some(quoted) = seed.quoted_id() {
                if let Ok(quoted_msg) = self.gateway.get_message(quoted).await {
                    collected.extend(quoted_msg.parts_of(kind));
                }
            }
        }
        if collected.len() >= count {
            collected.truncate(count);
            return Ok(collected);
        }

        // One prompt scope around the whole interaction, so the deadline
        // spans all follow-up turns.
        self.begin_prompt(origin, None);
        let mut failure = None;
        while collected.len() < count {
            let prompt = self
                .gateway
                .send_text(origin, &messages::need_more_parts(kind, count - collected.len()))
                .await
                .ok();
            let read = self.read_pipe().await;
            if let Some(handle) = prompt {
                let _ = self.gateway.delete_message(handle).await;
            }
            match read {
                Ok(msg) => collected.extend(msg.parts_of(kind)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        self.end_prompt();

        match failure {
            Some(err) => Err(err),
            None => {
                collected.truncate(count);
                Ok(collected)
            }
        }
    }
}

/// Registry of live sessions, keyed by peer id. Each session gets a reaper
/// that removes it after the configured span of continuous idleness.
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    config: Arc<AppConfig>,
    gateway: Arc<dyn Gateway>,
}

impl SessionManager {
    pub fn new(config: Arc<AppConfig>, gateway: Arc<dyn Gateway>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            gateway,
        })
    }

    /// The peer's session, created (with its reaper) on first contact.
    pub fn get(self: &Arc<Self>, peer: u64) -> Arc<Session> {
        let mut map = self.sessions.lock().expect("session registry poisoned");
        if let Some(session) = map.get(&peer) {
            return session.clone();
        }
        debug!(peer, "creating session");
        let session = Arc::new(Session::new(peer, self.config.clone(), self.gateway.clone()));
        map.insert(peer, session.clone());
        spawn_reaper(Arc::downgrade(self), session.clone(), self.config.session.idle_secs);
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session registry poisoned").len()
    }

    /// Removes the peer's entry only if it is still this exact session,
    /// so a reaper cannot evict a successor created after its own removal.
    fn remove_if_same(&self, peer: u64, session: &Arc<Session>) -> bool {
        let mut map = self.sessions.lock().expect("session registry poisoned");
        match map.get(&peer) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(&peer);
                debug!(peer, "session reaped");
                true
            }
            _ => false,
        }
    }
}

/// Ticks once per second; the idle counter resets whenever the session is
/// executing or prompting, and the session is removed once it has been
/// continuously idle for `idle_secs`.
fn spawn_reaper(manager: Weak<SessionManager>, session: Arc<Session>, idle_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut idle = 0u64;
        loop {
            ticker.tick().await;
            if session.is_busy() || session.is_getting() {
                idle = 0;
                continue;
            }
            idle += 1;
            if idle >= idle_secs {
                if let Some(manager) = manager.upgrade() {
                    manager.remove_if_same(session.peer(), &session);
                }
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mock::MockGateway;
    use crate::domain::message::Sender;
    use std::time::Instant as StdInstant;

    fn test_config(idle_secs: u64, input_timeout_secs: u64) -> Arc<AppConfig> {
        let mut config: AppConfig =
            serde_yaml::from_str("gateway:\n  host: http://mock\n").unwrap();
        config.session.idle_secs = idle_secs;
        config.session.input_timeout_secs = input_timeout_secs;
        Arc::new(config)
    }

    fn inbound(peer: u64, text: &str) -> Message {
        Message {
            id: 1,
            sender: Sender { id: peer, name: "peer".into() },
            target: Target::User(peer),
            parts: vec![MessagePart::text(text)],
        }
    }

    #[tokio::test]
    async fn execution_lock_is_single_flight() {
        let session = Session::new(7, test_config(30, 30), MockGateway::new());
        let guard = session.try_acquire().expect("first claim succeeds");
        assert!(session.is_busy());
        assert!(session.try_acquire().is_none());
        drop(guard);
        assert!(!session.is_busy());
        assert!(session.try_acquire().is_some());
    }

    #[tokio::test]
    async fn pipe_get_returns_queued_input_in_order() {
        let session = Session::new(7, test_config(30, 30), MockGateway::new());
        session.pipe_put(inbound(7, "first"));
        session.pipe_put(inbound(7, "second"));

        let a = session.pipe_get(Target::User(7), None, false).await.unwrap();
        let b = session.pipe_get(Target::User(7), None, false).await.unwrap();
        assert_eq!(a.first_text(), Some("first"));
        assert_eq!(b.first_text(), Some("second"));
    }

    #[tokio::test]
    async fn pipe_get_times_out_and_clears_getting() {
        let session = Session::new(7, test_config(30, 1), MockGateway::new());
        let started = StdInstant::now();
        let err = session.pipe_get(Target::User(7), None, false).await.unwrap_err();
        assert!(matches!(err, BotError::InputTimeout(1)));
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!session.is_getting());
    }

    #[tokio::test]
    async fn cancel_keyword_in_pipe_aborts_the_prompt() {
        let session = Session::new(7, test_config(30, 30), MockGateway::new());
        session.pipe_put(inbound(7, "cancel"));
        let err = session.pipe_get(Target::User(7), None, false).await.unwrap_err();
        assert!(matches!(err, BotError::Cancelled(_)));
    }

    #[tokio::test]
    async fn notify_prompt_is_posted_and_deleted() {
        let gateway = MockGateway::new();
        let session = Session::new(7, test_config(30, 30), gateway.clone());
        session.pipe_put(inbound(7, "answer"));

        let msg = session.pipe_get(Target::User(7), None, true).await.unwrap();
        assert_eq!(msg.first_text(), Some("answer"));
        assert_eq!(gateway.sent_texts().len(), 1);
        assert!(gateway.sent_texts()[0].contains("waiting for your input"));
        assert_eq!(gateway.deleted_ids().len(), 1);
    }

    #[tokio::test]
    async fn typed_collection_seeds_from_message_and_quote() {
        let gateway = MockGateway::new();
        let session = Session::new(7, test_config(30, 30), gateway.clone());

        let quoted = Message {
            id: 500,
            sender: Sender { id: 7, name: "peer".into() },
            target: Target::User(7),
            parts: vec![MessagePart::Image { url: Some("http://x/a.png".into()), data: None }],
        };
        gateway.script_message(quoted);

        let seed = Message {
            id: 2,
            sender: Sender { id: 7, name: "peer".into() },
            target: Target::User(7),
            parts: vec![MessagePart::Reply { message_id: 500 }, MessagePart::text("search")],
        };

        let parts = session
            .pipe_get_by_type(Target::User(7), &seed, PartKind::Image, 1)
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
        // Satisfied without prompting.
        assert!(gateway.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn typed_collection_prompts_for_shortfall_and_deletes_prompts() {
        let gateway = MockGateway::new();
        let session = Arc::new(Session::new(7, test_config(30, 30), gateway.clone()));

        let seed = inbound(7, "search");
        let worker = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .pipe_get_by_type(Target::User(7), &seed, PartKind::Image, 1)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_getting());

        // A plain text answer does not satisfy the image requirement.
        session.pipe_put(inbound(7, "not an image"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.pipe_put(Message {
            id: 3,
            sender: Sender { id: 7, name: "peer".into() },
            target: Target::User(7),
            parts: vec![MessagePart::Image { url: Some("http://x/b.png".into()), data: None }],
        });

        let parts = worker.await.unwrap().unwrap();
        assert_eq!(parts.len(), 1);
        assert!(!session.is_getting());
        // Two prompts were posted and both deleted.
        assert_eq!(gateway.sent_texts().len(), 2);
        assert_eq!(gateway.deleted_ids().len(), 2);
    }

    #[tokio::test]
    async fn typed_collection_deadline_spans_all_turns() {
        let gateway = MockGateway::new();
        let session = Arc::new(Session::new(7, test_config(30, 1), gateway.clone()));
        let seed = inbound(7, "search");

        let started = StdInstant::now();
        let worker = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .pipe_get_by_type(Target::User(7), &seed, PartKind::Image, 2)
                    .await
            })
        };

        // A partial answer mid-way must not reset the deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        session.pipe_put(Message {
            id: 3,
            sender: Sender { id: 7, name: "peer".into() },
            target: Target::User(7),
            parts: vec![MessagePart::Image { url: Some("http://x/a.png".into()), data: None }],
        });

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, BotError::InputTimeout(1)));
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reaper_removes_idle_session_but_spares_busy_one() {
        let manager = SessionManager::new(test_config(1, 30), MockGateway::new());
        let idle_session = manager.get(1);
        let busy_session = manager.get(2);
        let _guard = busy_session.try_acquire().unwrap();
        assert_eq!(manager.len(), 2);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(manager.len(), 1);
        assert!(!Arc::ptr_eq(&manager.get(1), &idle_session));
        assert!(Arc::ptr_eq(&manager.get(2), &busy_session));
    }

    #[tokio::test]
    async fn reset_interaction_drains_stale_input() {
        let session = Session::new(7, test_config(30, 30), MockGateway::new());
        session.pipe_put(inbound(7, "stale"));
        session.reset_interaction();

        session.pipe_put(inbound(7, "fresh"));
        let msg = session.pipe_get(Target::User(7), None, false).await.unwrap();
        assert_eq!(msg.first_text(), Some("fresh"));
    }
}
