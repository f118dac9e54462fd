//! # Message Model
//!
//! Transport-agnostic representation of an inbound or outbound chat message:
//! a sender, a conversational target (private user or group) and an ordered
//! list of message parts. The router receives already-parsed `Message`
//! values; how they arrive on the wire is the gateway's concern.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The kind of a message part, used for typed argument collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartKind {
    Text,
    Image,
    At,
    Reply,
    Face,
}

impl PartKind {
    /// Human-readable name used in shortfall prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::Image => "image",
            PartKind::At => "mention",
            PartKind::Reply => "reply",
            PartKind::Face => "face",
        }
    }
}

/// One segment of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text { text: String },
    Image { url: Option<String>, data: Option<Bytes> },
    At { user_id: u64 },
    Reply { message_id: i64 },
    Face { id: String },
}

impl MessagePart {
    pub fn kind(&self) -> PartKind {
        match self {
            MessagePart::Text { .. } => PartKind::Text,
            MessagePart::Image { .. } => PartKind::Image,
            MessagePart::At { .. } => PartKind::At,
            MessagePart::Reply { .. } => PartKind::Reply,
            MessagePart::Face { .. } => PartKind::Face,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

/// The conversation a message belongs to. Private chats are keyed by the
/// peer user id, group chats by the group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    User(u64),
    Group(u64),
}

impl Target {
    pub fn is_private(&self) -> bool {
        matches!(self, Target::User(_))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::User(id) => write!(f, "user {id}"),
            Target::Group(id) => write!(f, "group {id}"),
        }
    }
}

/// The account that sent a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub id: u64,
    pub name: String,
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Identifier of a message already accepted by the gateway, usable for
/// later retrieval or deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle(pub i64);

/// A fully parsed inbound message.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub sender: Sender,
    pub target: Target,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn is_private(&self) -> bool {
        self.target.is_private()
    }

    /// All parts of the given kind, in message order.
    pub fn parts_of(&self, kind: PartKind) -> Vec<MessagePart> {
        self.parts.iter().filter(|p| p.kind() == kind).cloned().collect()
    }

    /// The text of the first text part, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// The message id a leading reply part points at, if the message quotes
    /// another one.
    pub fn quoted_id(&self) -> Option<MessageHandle> {
        match self.parts.first() {
            Some(MessagePart::Reply { message_id }) => Some(MessageHandle(*message_id)),
            _ => None,
        }
    }
}

/// Splits command text into whitespace-separated tokens, dropping empties.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}
