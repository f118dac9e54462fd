//! # Configuration
//!
//! Manages the loading and parsing of the application's configuration file
//! (`data/config.yaml`). Defines the structs for the gateway connection,
//! bot identity, session tuning and HTTP behaviour.

use serde::Deserialize;

/// Main application configuration structure.
/// Matches the layout of `data/config.yaml`.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection settings for the OneBot HTTP frame server.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// The bot's own account id, used to ignore self-sent messages.
    #[serde(default)]
    pub id: u64,
    /// Command prefixes. An empty list means every message is a command
    /// candidate; otherwise a message must start with one of these, except
    /// that private messages bypass the prefix requirement.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    #[serde(default = "default_cancel_keyword")]
    pub cancel_keyword: String,
    /// When true, group messages must mention the bot to count as commands.
    #[serde(default)]
    pub must_at: bool,
}

impl BotConfig {
    /// Strips the first matching command prefix. An empty configured prefix
    /// matches every message.
    pub fn strip_prefix<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.prefixes.iter().find_map(|p| text.strip_prefix(p.as_str()))
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            id: 0,
            prefixes: default_prefixes(),
            cancel_keyword: default_cancel_keyword(),
            must_at: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Seconds the session lock must stay continuously unlocked before the
    /// reaper removes the session from the registry.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Deadline for a multi-turn input read, measured from the outermost
    /// nested prompt.
    #[serde(default = "default_input_timeout_secs")]
    pub input_timeout_secs: u64,
    /// Capacity of the per-session input pipe.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            input_timeout_secs: default_input_timeout_secs(),
            pipe_capacity: default_pipe_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Poll interval of the interruptible-request worker, in milliseconds.
    /// Bounds the cancellation latency of an in-flight network call.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall timeout for one outbound request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Bind address of the inbound event webhook.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_prefixes() -> Vec<String> {
    vec![String::new()]
}
fn default_cancel_keyword() -> String {
    "cancel".to_string()
}
fn default_idle_secs() -> u64 {
    30
}
fn default_input_timeout_secs() -> u64 {
    30
}
fn default_pipe_capacity() -> usize {
    8
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_bind() -> String {
    "0.0.0.0:5700".to_string()
}
