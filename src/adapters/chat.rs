//! Chat transport seam
//!
//! The monitor core only ever talks to users through [`ChatTransport`].
//! Inbound traffic from the command surface is normalized into
//! [`InboundEvent`] so replies work the same for messages and button presses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::info;

use crate::domain::UserId;
use crate::error::{Result, SpikeError};

/// Message markup mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageFormat {
    Plain,
    Markdown,
    Html,
}

impl MessageFormat {
    /// Bot API `parse_mode` value
    pub fn parse_mode(&self) -> Option<&'static str> {
        match self {
            MessageFormat::Plain => None,
            MessageFormat::Markdown => Some("Markdown"),
            MessageFormat::Html => Some("HTML"),
        }
    }
}

/// Profile data used for display names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatInfo {
    pub full_name: Option<String>,
    pub username: Option<String>,
}

impl ChatInfo {
    /// `@username`, then full name, then `User <id>`
    pub fn display_name(&self, id: UserId) -> String {
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{}", username);
        }
        if let Some(name) = self.full_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        format!("User {}", id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

/// Who a command list applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    Default,
    Chat(i64),
}

/// Outbound chat operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
        disable_preview: bool,
    ) -> Result<()>;

    async fn get_chat(&self, chat_id: i64) -> Result<ChatInfo>;

    async fn set_commands(&self, scope: CommandScope, commands: &[BotCommand]) -> Result<()>;
}

/// Normalized inbound update
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Plain chat message
    Chat {
        chat_id: i64,
        user_id: UserId,
        text: String,
    },
    /// Inline button press
    Callback {
        chat_id: i64,
        user_id: UserId,
        data: String,
        message_id: Option<i64>,
    },
}

impl InboundEvent {
    /// Decode a Bot API update; `None` for kinds the service ignores
    pub fn from_update(update: &Value) -> Option<Self> {
        if let Some(message) = update.get("message") {
            return Some(InboundEvent::Chat {
                chat_id: message.pointer("/chat/id")?.as_i64()?,
                user_id: message.pointer("/from/id")?.as_i64()?,
                text: message.get("text")?.as_str()?.to_string(),
            });
        }
        if let Some(query) = update.get("callback_query") {
            let user_id = query.pointer("/from/id")?.as_i64()?;
            return Some(InboundEvent::Callback {
                chat_id: query
                    .pointer("/message/chat/id")
                    .and_then(Value::as_i64)
                    .unwrap_or(user_id),
                user_id,
                data: query.get("data")?.as_str()?.to_string(),
                message_id: query.pointer("/message/message_id").and_then(Value::as_i64),
            });
        }
        None
    }

    pub fn user_id(&self) -> UserId {
        match self {
            InboundEvent::Chat { user_id, .. } | InboundEvent::Callback { user_id, .. } => *user_id,
        }
    }

    /// Chat that a reply to this event goes to
    pub fn reply_chat(&self) -> i64 {
        match self {
            InboundEvent::Chat { chat_id, .. } | InboundEvent::Callback { chat_id, .. } => *chat_id,
        }
    }

    /// Message text or callback payload
    pub fn payload(&self) -> &str {
        match self {
            InboundEvent::Chat { text, .. } => text,
            InboundEvent::Callback { data, .. } => data,
        }
    }

    /// Send a reply the same way regardless of event kind
    pub async fn reply(&self, transport: &dyn ChatTransport, text: &str) -> Result<()> {
        transport
            .send_message(self.reply_chat(), text, MessageFormat::Markdown, true)
            .await
    }
}

/// A message captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
}

/// Transport that logs and records messages instead of delivering them.
///
/// Used for `--dry-run` and in tests. Chats listed with [`RecordingTransport::fail_for`]
/// reject every message. A [`bounded`](RecordingTransport::bounded) transport keeps
/// only the newest messages.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<VecDeque<SentMessage>>,
    /// Most messages kept; `None` keeps everything
    limit: Option<usize>,
    failing: Mutex<Vec<i64>>,
    profiles: Mutex<HashMap<i64, ChatInfo>>,
    commands: Mutex<Vec<BotCommand>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` messages, dropping the oldest first
    pub fn bounded(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn fail_for(&self, chat_id: i64) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(chat_id);
        }
    }

    pub fn set_profile(&self, chat_id: i64, info: ChatInfo) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(chat_id, info);
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text)
            .collect()
    }

    pub fn commands(&self) -> Vec<BotCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _format: MessageFormat,
        _disable_preview: bool,
    ) -> Result<()> {
        let fails = self
            .failing
            .lock()
            .map(|f| f.contains(&chat_id))
            .unwrap_or(false);
        if fails {
            return Err(SpikeError::NotificationDelivery {
                chat_id,
                reason: "Forbidden: bot was blocked by the user".to_string(),
            });
        }

        info!(chat_id, "[dry-run] {}", text.replace('\n', " | "));
        if let Ok(mut sent) = self.sent.lock() {
            if let Some(limit) = self.limit {
                while sent.len() >= limit.max(1) {
                    sent.pop_front();
                }
            }
            sent.push_back(SentMessage {
                chat_id,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<ChatInfo> {
        Ok(self
            .profiles
            .lock()
            .ok()
            .and_then(|p| p.get(&chat_id).cloned())
            .unwrap_or_default())
    }

    async fn set_commands(&self, _scope: CommandScope, commands: &[BotCommand]) -> Result<()> {
        if let Ok(mut stored) = self.commands.lock() {
            *stored = commands.to_vec();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_name_fallbacks() {
        let info = ChatInfo {
            full_name: Some("Ada Lovelace".into()),
            username: Some("ada".into()),
        };
        assert_eq!(info.display_name(1), "@ada");

        let info = ChatInfo {
            full_name: Some("Ada Lovelace".into()),
            username: None,
        };
        assert_eq!(info.display_name(1), "Ada Lovelace");

        assert_eq!(ChatInfo::default().display_name(42), "User 42");
    }

    #[test]
    fn test_inbound_chat_event() {
        let update = json!({
            "update_id": 1,
            "message": {"message_id": 5, "from": {"id": 77}, "chat": {"id": 77}, "text": "/start"}
        });
        let event = InboundEvent::from_update(&update).unwrap();
        assert_eq!(event.user_id(), 77);
        assert_eq!(event.reply_chat(), 77);
        assert_eq!(event.payload(), "/start");
    }

    #[test]
    fn test_inbound_callback_event() {
        let update = json!({
            "update_id": 2,
            "callback_query": {
                "id": "abc",
                "from": {"id": 77},
                "data": "tier:disciple",
                "message": {"message_id": 9, "chat": {"id": -100}}
            }
        });
        let event = InboundEvent::from_update(&update).unwrap();
        assert_eq!(
            event,
            InboundEvent::Callback {
                chat_id: -100,
                user_id: 77,
                data: "tier:disciple".into(),
                message_id: Some(9)
            }
        );

        assert!(InboundEvent::from_update(&json!({"update_id": 3})).is_none());
    }

    #[tokio::test]
    async fn test_reply_goes_to_event_chat() {
        let transport = RecordingTransport::new();
        let event = InboundEvent::Callback {
            chat_id: -100,
            user_id: 77,
            data: "x".into(),
            message_id: None,
        };
        event.reply(&transport, "done").await.unwrap();
        assert_eq!(transport.sent_to(-100), vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn test_recording_transport_failures() {
        let transport = RecordingTransport::new();
        transport.fail_for(5);
        assert!(transport
            .send_message(5, "hi", MessageFormat::Plain, false)
            .await
            .is_err());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_transport_keeps_newest() {
        let transport = RecordingTransport::bounded(2);
        for text in ["one", "two", "three"] {
            transport
                .send_message(1, text, MessageFormat::Plain, false)
                .await
                .unwrap();
        }

        assert_eq!(transport.sent_to(1), vec!["two".to_string(), "three".to_string()]);
    }
}
