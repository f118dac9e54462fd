//! # Error Taxonomy
//!
//! Every failure a command handler can surface falls into one of these
//! categories. The router's supervision wrapper is the single point that
//! turns them into chat replies: the first four stop there, `Other` is
//! replied, logged at error severity and re-raised.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// The user typed the cancel keyword, or cancellation was requested
    /// while the handler was running.
    #[error("command cancelled: {0}")]
    Cancelled(String),

    /// A multi-turn read exceeded its deadline.
    #[error("no further input within {0} seconds, command cancelled")]
    InputTimeout(u64),

    /// The gateway rejected an outbound message.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// A handler precondition did not hold (bad user input).
    #[error("check failed: {0}")]
    Validation(String),

    /// Anything else. Logged with full diagnostics and re-raised after the
    /// user has been notified.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BotError::Validation(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        BotError::Cancelled(msg.into())
    }
}

/// Handler-side precondition check, surfaced to the user as "check failed".
#[macro_export]
macro_rules! check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::domain::error::BotError::Validation(format!($($arg)*)));
        }
    };
}
