//! Test double for the gateway seam. Records outbound traffic and serves
//! scripted messages for `get_message`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::domain::error::BotError;
use crate::domain::message::{Message, MessageHandle, MessagePart, Target};
use crate::domain::traits::Gateway;

#[derive(Default)]
pub struct MockGateway {
    pub sent: Mutex<Vec<(Target, String)>>,
    pub deleted: Mutex<Vec<MessageHandle>>,
    scripted: Mutex<HashMap<i64, Message>>,
    next_id: AtomicI64,
    pub fail_sends: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `get_message` return this message for its id.
    pub fn script_message(&self, msg: Message) {
        self.scripted.lock().unwrap().insert(msg.id, msg);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn deleted_ids(&self) -> Vec<MessageHandle> {
        self.deleted.lock().unwrap().clone()
    }

    fn render(parts: &[MessagePart]) -> String {
        parts
            .iter()
            .map(|p| match p {
                MessagePart::Text { text } => text.clone(),
                MessagePart::Image { .. } => "[image]".to_string(),
                MessagePart::At { user_id } => format!("[at:{user_id}]"),
                MessagePart::Reply { message_id } => format!("[reply:{message_id}]"),
                MessagePart::Face { id } => format!("[face:{id}]"),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageHandle, BotError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BotError::SendFailure("mock send disabled".to_string()));
        }
        self.sent.lock().unwrap().push((target, text.to_string()));
        Ok(MessageHandle(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn send_parts(
        &self,
        target: Target,
        parts: &[MessagePart],
    ) -> Result<MessageHandle, BotError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BotError::SendFailure("mock send disabled".to_string()));
        }
        self.sent.lock().unwrap().push((target, Self::render(parts)));
        Ok(MessageHandle(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_friend_list(&self) -> Result<Vec<u64>, BotError> {
        Ok(Vec::new())
    }

    async fn get_message(&self, id: MessageHandle) -> Result<Message, BotError> {
        self.scripted
            .lock()
            .unwrap()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| BotError::Other(anyhow!("no such message: {}", id.0)))
    }

    async fn delete_message(&self, id: MessageHandle) -> Result<(), BotError> {
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }
}
