//! # Domain Traits
//!
//! Abstract interface for the messaging gateway. The core treats the
//! gateway as opaque; the OneBot HTTP client in `infrastructure` is the
//! production implementation and tests substitute a mock.

use async_trait::async_trait;

use crate::domain::error::BotError;
use crate::domain::message::{Message, MessageHandle, MessagePart, Target};

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a plain text message to the target conversation.
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageHandle, BotError>;

    /// Send a multi-part message to the target conversation.
    async fn send_parts(
        &self,
        target: Target,
        parts: &[MessagePart],
    ) -> Result<MessageHandle, BotError>;

    /// User ids of the bot account's friends.
    async fn get_friend_list(&self) -> Result<Vec<u64>, BotError>;

    /// Retrieve a previously sent or received message by id.
    async fn get_message(&self, id: MessageHandle) -> Result<Message, BotError>;

    /// Delete (recall) a message by id.
    async fn delete_message(&self, id: MessageHandle) -> Result<(), BotError>;
}
