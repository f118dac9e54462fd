//! # Command Router
//!
//! Receives parsed inbound messages and drives the full command lifecycle:
//! prefix matching, session lookup, multi-turn input forwarding, busy and
//! cancel handling, argument collection, handler execution under a
//! `CancellableTask`, and the supervision wrapper that turns handler errors
//! into chat replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::application::session::{CancelCurrent, Session, SessionManager};
use crate::application::task::{CancelToken, CancellableTask, TaskError};
use crate::domain::config::AppConfig;
use crate::domain::error::BotError;
use crate::domain::message::{tokenize, Message, MessagePart, PartKind, Target};
use crate::domain::traits::Gateway;
use crate::strings::messages;

/// How a command's arguments are collected before its handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSpec {
    /// No arguments; trailing text is ignored.
    None,
    /// Everything after the command name, as one trimmed string.
    Raw,
    /// Whitespace-separated tokens after the command name.
    Tokens,
    /// Exactly `count` parts of `kind`, collected interactively when the
    /// triggering message falls short.
    Typed { kind: PartKind, count: usize },
}

#[derive(Debug, Clone)]
pub enum CommandArgs {
    None,
    Raw(String),
    Tokens(Vec<String>),
    Typed(Vec<MessagePart>),
}

/// Static description of a registered command, also surfaced by `help`.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub cancelable: bool,
}

/// Everything a handler gets to work with.
pub struct CommandContext {
    pub message: Message,
    pub args: CommandArgs,
    pub session: Arc<Session>,
    pub gateway: Arc<dyn Gateway>,
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionManager>,
    pub token: CancelToken,
    pub commands: Arc<[CommandInfo]>,
    pub started_at: Instant,
}

impl CommandContext {
    /// The conversation replies for this invocation go to.
    pub fn origin(&self) -> Target {
        self.message.target
    }

    pub async fn reply(&self, text: &str) -> Result<(), BotError> {
        self.gateway.send_text(self.origin(), text).await.map(|_| ())
    }
}

type Handler = Arc<dyn Fn(CommandContext) -> BoxFuture<'static, Result<(), BotError>> + Send + Sync>;

pub struct Command {
    pub info: CommandInfo,
    pub spec: ArgSpec,
    handler: Handler,
}

impl Command {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        spec: ArgSpec,
        cancelable: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BotError>> + Send + 'static,
    {
        Self {
            info: CommandInfo {
                name: name.into(),
                aliases: Vec::new(),
                description: description.into(),
                cancelable,
            },
            spec,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.info.aliases.push(alias.into());
        self
    }
}

/// How long a busy-path cancel waits for the running task to settle before
/// telling the user it is still winding down.
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandRouter {
    config: Arc<AppConfig>,
    gateway: Arc<dyn Gateway>,
    sessions: Arc<SessionManager>,
    commands: Vec<Arc<Command>>,
    /// Exact, case-sensitive name/alias lookup.
    index: HashMap<String, usize>,
    infos: Arc<[CommandInfo]>,
    started_at: Instant,
}

impl CommandRouter {
    pub fn new(
        config: Arc<AppConfig>,
        gateway: Arc<dyn Gateway>,
        sessions: Arc<SessionManager>,
        commands: Vec<Command>,
    ) -> Self {
        let commands: Vec<Arc<Command>> = commands.into_iter().map(Arc::new).collect();
        let mut index = HashMap::new();
        for (i, command) in commands.iter().enumerate() {
            index.insert(command.info.name.clone(), i);
            for alias in &command.info.aliases {
                index.insert(alias.clone(), i);
            }
        }
        let infos: Arc<[CommandInfo]> =
            commands.iter().map(|c| c.info.clone()).collect::<Vec<_>>().into();
        Self {
            config,
            gateway,
            sessions,
            commands,
            index,
            infos,
            started_at: Instant::now(),
        }
    }

    async fn reply(&self, target: Target, text: &str) {
        if let Err(err) = self.gateway.send_text(target, text).await {
            warn!(%target, error = %err, "failed to send reply");
        }
    }

    /// Entry point for every inbound message. At most one command runs per
    /// session; messages arriving while one is running either feed its
    /// prompt, cancel it, or are bounced.
    pub async fn route(&self, msg: Message) -> Result<(), BotError> {
        if self.config.bot.id != 0 && msg.sender.id == self.config.bot.id {
            return Ok(());
        }
        let session = self.sessions.get(msg.sender.id);

        let text = msg.first_text().unwrap_or("");
        let stripped = self.config.bot.strip_prefix(text);
        // Private chats bypass both the prefix and the mention requirement.
        let is_command = if msg.is_private() {
            true
        } else {
            let mentioned = !self.config.bot.must_at
                || msg.parts.iter().any(
                    |p| matches!(p, MessagePart::At { user_id } if *user_id == self.config.bot.id),
                );
            stripped.is_some() && mentioned
        };
        let command_text = stripped.unwrap_or(text).to_string();

        // A waiting prompt consumes the message before anything else.
        if session.is_getting() {
            if let Some(expected) = session.interaction_target() {
                if expected != msg.target {
                    self.reply(msg.target, &messages::redirected_input(expected)).await;
                    return Ok(());
                }
            }
            session.pipe_put(msg);
            return Ok(());
        }

        if session.is_busy() {
            if !is_command {
                return Ok(());
            }
            let first = tokenize(&command_text).into_iter().next().unwrap_or_default();
            if first == self.config.bot.cancel_keyword {
                match session.cancel_current(Some(CANCEL_SETTLE_TIMEOUT)).await {
                    CancelCurrent::NotCancelable => {
                        self.reply(msg.target, messages::NOT_CANCELABLE).await;
                    }
                    CancelCurrent::Done => {
                        // The supervised invocation replies its own
                        // cancellation confirmation.
                        info!(peer = msg.sender.id, "running command cancelled");
                    }
                    CancelCurrent::TimedOut | CancelCurrent::NotRunning => {
                        self.reply(msg.target, messages::CANCEL_PENDING).await;
                    }
                }
            } else {
                self.reply(msg.target, messages::BUSY).await;
            }
            return Ok(());
        }

        if !is_command {
            return Ok(());
        }
        let trimmed = command_text.trim();
        if trimmed.is_empty() {
            self.reply(msg.target, messages::EMPTY_COMMAND).await;
            return Ok(());
        }
        let (name, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };
        let Some(command) = self.index.get(name).map(|&i| self.commands[i].clone()) else {
            self.reply(msg.target, messages::UNKNOWN_COMMAND).await;
            return Ok(());
        };

        // Claim the execution lock; a loss here means another invocation won
        // the race since the busy probe above.
        let Some(guard) = session.try_acquire() else {
            self.reply(msg.target, messages::BUSY).await;
            return Ok(());
        };

        info!(peer = %msg.sender, command = %command.info.name, "dispatching command");
        let outcome = {
            let token = CancelToken::new();
            let ctx_base = (
                msg.clone(),
                session.clone(),
                self.gateway.clone(),
                self.config.clone(),
                self.sessions.clone(),
                self.infos.clone(),
                self.started_at,
            );
            let spec = command.spec;
            let handler = command.handler.clone();
            let rest = rest.to_string();
            let task_token = token.clone();
            let task = CancellableTask::with_token(token, async move {
                let (message, session, gateway, config, sessions, commands, started_at) = ctx_base;
                let args = match spec {
                    ArgSpec::None => CommandArgs::None,
                    ArgSpec::Raw => CommandArgs::Raw(rest),
                    ArgSpec::Tokens => CommandArgs::Tokens(tokenize(&rest)),
                    ArgSpec::Typed { kind, count } => CommandArgs::Typed(
                        session
                            .pipe_get_by_type(message.target, &message, kind, count)
                            .await?,
                    ),
                };
                let ctx = CommandContext {
                    message,
                    args,
                    session,
                    gateway,
                    config,
                    sessions,
                    token: task_token,
                    commands,
                    started_at,
                };
                handler(ctx).await
            });

            session.set_running(task.handle(), command.info.cancelable);
            if let Err(err) = task.start() {
                session.clear_running();
                drop(guard);
                return Err(BotError::Other(anyhow!("failed to start command task: {err}")));
            }
            let outcome = task.join(None).await;
            session.clear_running();
            // Covers interaction state a cancelled handler left behind.
            session.reset_interaction();
            drop(guard);
            outcome
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(TaskError::Cancelled(reason)) => {
                self.reply(msg.target, &BotError::Cancelled(reason).to_string()).await;
                Ok(())
            }
            Err(TaskError::Failed(inner)) => match &*inner {
                BotError::Cancelled(_)
                | BotError::InputTimeout(_)
                | BotError::Validation(_) => {
                    self.reply(msg.target, &inner.to_string()).await;
                    Ok(())
                }
                BotError::SendFailure(_) => {
                    // Replying about a failed send is best effort by nature.
                    self.reply(msg.target, &inner.to_string()).await;
                    warn!(command = %command.info.name, error = %inner, "send failure in command");
                    Ok(())
                }
                BotError::Other(_) => {
                    self.reply(msg.target, &format!("command failed: {inner}")).await;
                    error!(command = %command.info.name, error = %inner, "command failed");
                    Err(BotError::Other(anyhow!("command {} failed: {inner}", command.info.name)))
                }
            },
            Err(err @ (TaskError::InvalidState(_) | TaskError::JoinTimeout)) => {
                error!(command = %command.info.name, error = %err, "task lifecycle error");
                Err(BotError::Other(anyhow!("task lifecycle error: {err}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mock::MockGateway;
    use crate::domain::message::Sender;

    fn test_config(prefixes: Vec<&str>) -> Arc<AppConfig> {
        let mut config: AppConfig =
            serde_yaml::from_str("gateway:\n  host: http://mock\n").unwrap();
        config.bot.prefixes = prefixes.into_iter().map(str::to_string).collect();
        config.session.input_timeout_secs = 2;
        Arc::new(config)
    }

    fn router(
        gateway: Arc<MockGateway>,
        config: Arc<AppConfig>,
        commands: Vec<Command>,
    ) -> Arc<CommandRouter> {
        let sessions = SessionManager::new(config.clone(), gateway.clone());
        Arc::new(CommandRouter::new(config, gateway, sessions, commands))
    }

    fn private(peer: u64, text: &str) -> Message {
        Message {
            id: 1,
            sender: Sender { id: peer, name: "peer".into() },
            target: Target::User(peer),
            parts: vec![MessagePart::text(text)],
        }
    }

    fn group(peer: u64, group_id: u64, text: &str) -> Message {
        Message {
            id: 1,
            sender: Sender { id: peer, name: "peer".into() },
            target: Target::Group(group_id),
            parts: vec![MessagePart::text(text)],
        }
    }

    fn echo_command() -> Command {
        Command::new("echo", "repeat the input", ArgSpec::Raw, false, |ctx| async move {
            let CommandArgs::Raw(text) = &ctx.args else { unreachable!() };
            ctx.reply(text).await
        })
    }

    fn sleepy_command(delay: Duration, cancelable: bool) -> Command {
        Command::new("work", "sleep", ArgSpec::None, cancelable, move |ctx| async move {
            tokio::time::sleep(delay).await;
            ctx.reply("done").await
        })
    }

    #[tokio::test]
    async fn dispatches_and_replies() {
        let gateway = MockGateway::new();
        let router = router(gateway.clone(), test_config(vec![""]), vec![echo_command()]);

        router.route(private(7, "echo hello world")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hello world"]);
    }

    #[tokio::test]
    async fn unknown_command_gets_a_hint() {
        let gateway = MockGateway::new();
        let router = router(gateway.clone(), test_config(vec![""]), vec![echo_command()]);

        router.route(private(7, "frobnicate")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec![messages::UNKNOWN_COMMAND]);
    }

    #[tokio::test]
    async fn alias_resolves_to_the_same_command() {
        let gateway = MockGateway::new();
        let router = router(
            gateway.clone(),
            test_config(vec![""]),
            vec![echo_command().alias("say")],
        );
        router.route(private(7, "say hi")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn group_messages_require_a_prefix_private_ones_do_not() {
        let gateway = MockGateway::new();
        let router = router(gateway.clone(), test_config(vec!["/"]), vec![echo_command()]);

        // Unprefixed group message is not a command at all.
        router.route(group(7, 99, "echo hi")).await.unwrap();
        assert!(gateway.sent_texts().is_empty());

        router.route(group(7, 99, "/echo hi")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hi"]);

        router.route(private(7, "echo again")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hi", "again"]);
    }

    #[tokio::test]
    async fn group_commands_can_require_a_mention() {
        let gateway = MockGateway::new();
        let mut config: AppConfig =
            serde_yaml::from_str("gateway:\n  host: http://mock\n").unwrap();
        config.bot.id = 1000;
        config.bot.must_at = true;
        let router = router(gateway.clone(), Arc::new(config), vec![echo_command()]);

        router.route(group(7, 99, "echo hi")).await.unwrap();
        assert!(gateway.sent_texts().is_empty());

        let mut msg = group(7, 99, "echo hi");
        msg.parts.insert(0, MessagePart::At { user_id: 1000 });
        router.route(msg).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn second_command_while_busy_is_bounced() {
        let gateway = MockGateway::new();
        let router = router(
            gateway.clone(),
            test_config(vec![""]),
            vec![sleepy_command(Duration::from_millis(300), false), echo_command()],
        );

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "work")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.route(private(7, "echo hi")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec![messages::BUSY]);

        background.await.unwrap().unwrap();
        assert_eq!(gateway.sent_texts(), vec![messages::BUSY, "done"]);
    }

    #[tokio::test]
    async fn cancel_keyword_stops_a_cancelable_command() {
        let gateway = MockGateway::new();
        let router = router(
            gateway.clone(),
            test_config(vec![""]),
            vec![sleepy_command(Duration::from_secs(60), true)],
        );

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "work")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.route(private(7, "cancel")).await.unwrap();
        background.await.unwrap().unwrap();

        let texts = gateway.sent_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("command cancelled"));

        // The session is free again afterwards.
        let session = router.sessions.get(7);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn cancel_keyword_is_rejected_for_non_cancelable_commands() {
        let gateway = MockGateway::new();
        let router = router(
            gateway.clone(),
            test_config(vec![""]),
            vec![sleepy_command(Duration::from_millis(300), false)],
        );

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "work")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.route(private(7, "cancel")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec![messages::NOT_CANCELABLE]);
        background.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn messages_during_a_prompt_feed_the_pipe() {
        let gateway = MockGateway::new();
        let ask = Command::new("ask", "prompt once", ArgSpec::None, true, |ctx| async move {
            let answer = ctx.session.pipe_get(ctx.origin(), None, false).await?;
            ctx.reply(&format!("got: {}", answer.first_text().unwrap_or(""))).await
        });
        let router = router(gateway.clone(), test_config(vec![""]), vec![ask]);

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "ask")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.route(private(7, "blue")).await.unwrap();
        background.await.unwrap().unwrap();
        assert_eq!(gateway.sent_texts(), vec!["got: blue"]);
    }

    #[tokio::test]
    async fn prompt_input_from_another_conversation_is_redirected() {
        let gateway = MockGateway::new();
        let ask = Command::new("ask", "prompt once", ArgSpec::None, true, |ctx| async move {
            let answer = ctx.session.pipe_get(ctx.origin(), None, false).await?;
            ctx.reply(answer.first_text().unwrap_or("")).await
        });
        let router = router(gateway.clone(), test_config(vec![""]), vec![ask]);

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "ask")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same peer answering from a group chat gets pointed back.
        router.route(group(7, 99, "blue")).await.unwrap();
        let texts = gateway.sent_texts();
        assert!(texts[0].contains("waiting for input"));

        router.route(private(7, "green")).await.unwrap();
        background.await.unwrap().unwrap();
        assert_eq!(gateway.sent_texts().last().unwrap(), "green");
    }

    #[tokio::test]
    async fn validation_failures_are_replied_not_raised() {
        let gateway = MockGateway::new();
        let strict = Command::new("strict", "always complains", ArgSpec::None, false, |_ctx| async {
            Err(BotError::validation("argument out of range"))
        });
        let router = router(gateway.clone(), test_config(vec![""]), vec![strict]);

        router.route(private(7, "strict")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["check failed: argument out of range"]);
    }

    #[tokio::test]
    async fn gateway_send_failure_is_contained_and_session_stays_usable() {
        let gateway = MockGateway::new();
        let router = router(gateway.clone(), test_config(vec![""]), vec![echo_command()]);

        // The handler's reply fails, and so does the error notification;
        // both are best effort and the invocation still settles cleanly.
        gateway.fail_sends.store(true, std::sync::atomic::Ordering::SeqCst);
        router.route(private(7, "echo hi")).await.unwrap();
        assert!(gateway.sent_texts().is_empty());
        assert!(!router.sessions.get(7).is_busy());

        // Once the gateway recovers, the same session serves the next
        // command as usual.
        gateway.fail_sends.store(false, std::sync::atomic::Ordering::SeqCst);
        router.route(private(7, "echo hi")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn unexpected_errors_are_replied_and_reraised() {
        let gateway = MockGateway::new();
        let broken = Command::new("broken", "fails", ArgSpec::None, false, |_ctx| async {
            Err(BotError::Other(anyhow!("database exploded")))
        });
        let router = router(gateway.clone(), test_config(vec![""]), vec![broken]);

        let result = router.route(private(7, "broken")).await;
        assert!(result.is_err());
        assert!(gateway.sent_texts()[0].contains("database exploded"));
    }

    #[tokio::test]
    async fn empty_command_text_gets_a_hint() {
        let gateway = MockGateway::new();
        let router = router(gateway.clone(), test_config(vec!["/"]), vec![echo_command()]);
        router.route(group(7, 99, "/")).await.unwrap();
        assert_eq!(gateway.sent_texts(), vec![messages::EMPTY_COMMAND]);
    }

    #[tokio::test]
    async fn typed_arguments_are_collected_interactively() {
        let gateway = MockGateway::new();
        let search = Command::new(
            "search",
            "reverse image search",
            ArgSpec::Typed { kind: PartKind::Image, count: 1 },
            true,
            |ctx| async move {
                let CommandArgs::Typed(parts) = &ctx.args else { unreachable!() };
                ctx.reply(&format!("searching {} image(s)", parts.len())).await
            },
        );
        let router = router(gateway.clone(), test_config(vec![""]), vec![search]);

        let background = {
            let router = router.clone();
            tokio::spawn(async move { router.route(private(7, "search")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Prompt went out; answer with an image.
        assert!(gateway.sent_texts()[0].contains("please send 1 more image"));
        router
            .route(Message {
                id: 2,
                sender: Sender { id: 7, name: "peer".into() },
                target: Target::User(7),
                parts: vec![MessagePart::Image { url: Some("http://x/i.png".into()), data: None }],
            })
            .await
            .unwrap();

        background.await.unwrap().unwrap();
        assert_eq!(gateway.sent_texts().last().unwrap(), "searching 1 image(s)");
        // The prompt was deleted after the answer arrived.
        assert_eq!(gateway.deleted_ids().len(), 1);
    }
}
