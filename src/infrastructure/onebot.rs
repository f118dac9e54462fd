//! # OneBot HTTP Gateway
//!
//! Production implementation of the `Gateway` trait against a OneBot v11
//! HTTP frame server, plus the parser that turns inbound webhook events
//! into domain `Message` values. Message bodies travel as segment arrays;
//! this module owns the mapping between segments and `MessagePart`s.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::config::AppConfig;
use crate::domain::error::BotError;
use crate::domain::message::{Message, MessageHandle, MessagePart, Sender, Target};
use crate::domain::traits::Gateway;

pub struct OneBotClient {
    host: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    retcode: i64,
    #[serde(default)]
    data: Value,
}

impl OneBotClient {
    pub fn new(config: &AppConfig) -> Result<Self, BotError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.request_timeout_secs))
            .build()
            .map_err(|e| BotError::Other(anyhow!("failed to build http client: {e}")))?;
        Ok(Self {
            host: config.gateway.host.trim_end_matches('/').to_string(),
            token: config.gateway.token.clone(),
            client,
        })
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, BotError> {
        let url = format!("{}/{}", self.host, action);
        debug!(action, "gateway call");
        let mut request = self.client.post(&url).json(&params);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BotError::Other(anyhow!("gateway request {action} failed: {e}")))?;
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| BotError::Other(anyhow!("gateway response for {action} unreadable: {e}")))?;
        if envelope.status == "failed" {
            return Err(BotError::Other(anyhow!(
                "gateway action {action} failed with retcode {}",
                envelope.retcode
            )));
        }
        Ok(envelope.data)
    }
}

/// Domain parts to OneBot segment array.
pub fn to_segments(parts: &[MessagePart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(json!({"type": "text", "data": {"text": text}})),
            MessagePart::Image { url: Some(url), .. } => {
                Some(json!({"type": "image", "data": {"file": url}}))
            }
            MessagePart::Image { url: None, data: Some(bytes) } => Some(json!({
                "type": "image",
                "data": {"file": format!("base64://{}", BASE64.encode(bytes))}
            })),
            MessagePart::Image { url: None, data: None } => None,
            MessagePart::At { user_id } => {
                Some(json!({"type": "at", "data": {"qq": user_id.to_string()}}))
            }
            MessagePart::Reply { message_id } => {
                Some(json!({"type": "reply", "data": {"id": message_id.to_string()}}))
            }
            MessagePart::Face { id } => Some(json!({"type": "face", "data": {"id": id}})),
        })
        .collect()
}

fn field_u64(data: &Value, key: &str) -> Option<u64> {
    match &data[key] {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_i64(data: &Value, key: &str) -> Option<i64> {
    match &data[key] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// OneBot message body to domain parts. Accepts both the segment-array form
/// and the plain string form.
pub fn from_message_body(body: &Value) -> Vec<MessagePart> {
    match body {
        Value::String(text) => vec![MessagePart::text(text.clone())],
        Value::Array(segments) => segments
            .iter()
            .filter_map(|segment| {
                let data = &segment["data"];
                match segment["type"].as_str()? {
                    "text" => Some(MessagePart::text(data["text"].as_str()?.to_string())),
                    "image" => Some(MessagePart::Image {
                        url: data["url"]
                            .as_str()
                            .or_else(|| data["file"].as_str())
                            .map(str::to_string),
                        data: None,
                    }),
                    "at" => Some(MessagePart::At { user_id: field_u64(data, "qq")? }),
                    "reply" => Some(MessagePart::Reply { message_id: field_i64(data, "id")? }),
                    "face" => Some(MessagePart::Face {
                        id: match &data["id"] {
                            Value::String(s) => s.clone(),
                            Value::Number(n) => n.to_string(),
                            _ => return None,
                        },
                    }),
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Parses one inbound webhook event. Non-message events and malformed
/// payloads yield `None`.
pub fn parse_event(event: &Value) -> Option<Message> {
    if event["post_type"].as_str()? != "message" {
        return None;
    }
    let user_id = field_u64(event, "user_id")?;
    let target = match event["message_type"].as_str()? {
        "private" => Target::User(user_id),
        "group" => Target::Group(field_u64(event, "group_id")?),
        _ => return None,
    };
    let sender = Sender {
        id: user_id,
        name: event["sender"]["nickname"].as_str().unwrap_or_default().to_string(),
    };
    Some(Message {
        id: field_i64(event, "message_id")?,
        sender,
        target,
        parts: from_message_body(&event["message"]),
    })
}

#[async_trait]
impl Gateway for OneBotClient {
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageHandle, BotError> {
        self.send_parts(target, &[MessagePart::text(text)]).await
    }

    async fn send_parts(
        &self,
        target: Target,
        parts: &[MessagePart],
    ) -> Result<MessageHandle, BotError> {
        let segments = to_segments(parts);
        let (action, params) = match target {
            Target::User(user_id) => {
                ("send_private_msg", json!({"user_id": user_id, "message": segments}))
            }
            Target::Group(group_id) => {
                ("send_group_msg", json!({"group_id": group_id, "message": segments}))
            }
        };
        let data = self
            .call(action, params)
            .await
            .map_err(|e| BotError::SendFailure(e.to_string()))?;
        field_i64(&data, "message_id")
            .map(MessageHandle)
            .ok_or_else(|| BotError::SendFailure("gateway returned no message id".to_string()))
    }

    async fn get_friend_list(&self) -> Result<Vec<u64>, BotError> {
        let data = self.call("get_friend_list", json!({})).await?;
        let friends = data
            .as_array()
            .ok_or_else(|| BotError::Other(anyhow!("friend list is not an array")))?;
        Ok(friends.iter().filter_map(|f| field_u64(f, "user_id")).collect())
    }

    async fn get_message(&self, id: MessageHandle) -> Result<Message, BotError> {
        let data = self.call("get_msg", json!({"message_id": id.0})).await?;
        let user_id = field_u64(&data["sender"], "user_id").unwrap_or_default();
        let target = match field_u64(&data, "group_id") {
            Some(group_id) => Target::Group(group_id),
            None => Target::User(user_id),
        };
        Ok(Message {
            id: field_i64(&data, "message_id").unwrap_or(id.0),
            sender: Sender {
                id: user_id,
                name: data["sender"]["nickname"].as_str().unwrap_or_default().to_string(),
            },
            target,
            parts: from_message_body(&data["message"]),
        })
    }

    async fn delete_message(&self, id: MessageHandle) -> Result<(), BotError> {
        self.call("delete_msg", json!({"message_id": id.0})).await.map(|_| ())
    }
}
